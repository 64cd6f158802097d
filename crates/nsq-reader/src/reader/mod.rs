// Reader lifecycle and the engine task that drives discovery and connection
// bookkeeping.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ReaderConfig, ReaderOptions};
use crate::connection::tcp::TcpConnectionFactory;
use crate::connection::{ConnectionFactory, ConnectionNotice};
use crate::error::{ConfigError, ReaderError};
use crate::events::{EventBus, EventStream};
use crate::flow::{FlowControl, ReadyBalancer};
use crate::lookup::{HttpLookup, LookupClient};

mod discovery;
mod registry;
pub mod router;

pub use discovery::DiscoveryMode;

use discovery::{Discovery, LookupResult};
use registry::ConnectionRegistry;

/// Builds a [`Reader`], optionally swapping out the default collaborators.
pub struct ReaderBuilder {
    topic: String,
    channel: String,
    options: ReaderOptions,
    factory: Option<Arc<dyn ConnectionFactory>>,
    flow: Option<Arc<dyn FlowControl>>,
    lookup: Option<Arc<dyn LookupClient>>,
}

impl ReaderBuilder {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            options: ReaderOptions::default(),
            factory: None,
            flow: None,
            lookup: None,
        }
    }

    pub fn options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn flow_control(mut self, flow: Arc<dyn FlowControl>) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn lookup_client(mut self, lookup: Arc<dyn LookupClient>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Validates the options. Nothing connects until [`Reader::connect`].
    pub fn build(self) -> Result<Reader, ConfigError> {
        let config = Arc::new(ReaderConfig::resolve(
            self.topic,
            self.channel,
            self.options,
        )?);
        let flow = self.flow.unwrap_or_else(|| {
            Arc::new(ReadyBalancer::new(
                config.max_in_flight,
                config.max_backoff_duration,
            ))
        });
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(TcpConnectionFactory::new()));
        let lookup = self.lookup.unwrap_or_else(|| Arc::new(HttpLookup::new()));
        Ok(Reader {
            mode: DiscoveryMode::for_config(&config),
            shared: Arc::new(Shared {
                config,
                flow,
                bus: EventBus::default(),
                state: Mutex::new(EngineState::Idle),
            }),
            factory,
            lookup,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Consumer for one topic/channel pair.
///
/// ```no_run
/// use nsq_reader::{Reader, ReaderEvent, ReaderOptions};
///
/// # async fn run() -> anyhow::Result<()> {
/// let reader = Reader::new(
///     "orders",
///     "billing",
///     ReaderOptions {
///         nsqd_tcp_addresses: "127.0.0.1:4150".into(),
///         ..Default::default()
///     },
/// )?;
/// let mut events = reader.events();
/// reader.connect()?;
/// while let Some(event) = events.next().await {
///     if let ReaderEvent::Message(message) = event {
///         message.finish();
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Reader {
    mode: DiscoveryMode,
    shared: Arc<Shared>,
    factory: Arc<dyn ConnectionFactory>,
    lookup: Arc<dyn LookupClient>,
    shutdown: CancellationToken,
}

// State reachable from both the `Reader` handle and the engine task.
struct Shared {
    config: Arc<ReaderConfig>,
    flow: Arc<dyn FlowControl>,
    bus: EventBus,
    state: Mutex<EngineState>,
}

enum EngineState {
    Idle,
    Running(Engine),
    // Closed, waiting for the connections tracked at close time to report
    // `closed`.
    Draining(ConnectionRegistry),
    Closed,
}

struct Engine {
    registry: ConnectionRegistry,
    discovery: Discovery,
}

impl Reader {
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        options: ReaderOptions,
    ) -> Result<Self, ConfigError> {
        ReaderBuilder::new(topic, channel).options(options).build()
    }

    pub fn builder(topic: impl Into<String>, channel: impl Into<String>) -> ReaderBuilder {
        ReaderBuilder::new(topic, channel)
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.shared.config
    }

    pub fn mode(&self) -> DiscoveryMode {
        self.mode
    }

    /// Subscribe to reader events. Streams registered after an event was
    /// published do not see it.
    pub fn events(&self) -> EventStream {
        self.shared.bus.subscribe()
    }

    /// Number of nsqd targets currently tracked (connecting or connected).
    pub fn connection_count(&self) -> usize {
        match &*self.shared.lock() {
            EngineState::Running(engine) => engine.registry.len(),
            EngineState::Draining(registry) => registry.len(),
            EngineState::Idle | EngineState::Closed => 0,
        }
    }

    /// Run the first discovery pass now and schedule the recurring ones.
    ///
    /// Recurring passes start after a random delay of up to
    /// `lookupd_poll_jitter * lookupd_poll_interval` plus one interval. A zero
    /// interval disables them.
    pub fn connect(&self) -> Result<(), ReaderError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ReaderError::NoRuntime)?;
        let mut state = self.shared.lock();
        match &*state {
            EngineState::Running(_) => return Err(ReaderError::AlreadyConnected),
            EngineState::Draining(_) | EngineState::Closed => return Err(ReaderError::Closed),
            EngineState::Idle => {}
        }

        let config = &self.shared.config;
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();
        let mut engine = Engine {
            registry: ConnectionRegistry::new(
                config,
                self.factory.clone(),
                self.shared.flow.clone(),
                notice_tx,
            ),
            discovery: Discovery::new(config, self.lookup.clone(), lookup_tx),
        };
        engine.pass(self.shared.flow.as_ref());
        *state = EngineState::Running(engine);
        drop(state);

        let delay = config.startup_jitter(rand::random::<f64>());
        tracing::info!(
            topic = %config.topic,
            channel = %config.channel,
            mode = ?self.mode,
            ?delay,
            "reader connected"
        );
        runtime.spawn(run_engine(
            self.shared.clone(),
            notice_rx,
            lookup_rx,
            ticker(delay, config.lookupd_poll_interval),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Stop discovery passes. Open connections stay open; flow control drops
    /// their RDY to zero.
    pub fn pause(&self) {
        self.shared.flow.pause();
    }

    /// Resume discovery. The next scheduled pass runs normally.
    pub fn unpause(&self) {
        self.shared.flow.unpause();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.flow.is_paused()
    }

    /// Stop polling and close every connection without draining in-flight
    /// messages. Safe to call more than once.
    ///
    /// Each connection tracked at this point still produces one
    /// `NsqdClosed`; event streams end after the last of them.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        match std::mem::replace(&mut *state, EngineState::Closed) {
            EngineState::Running(Engine { registry, .. }) if registry.len() > 0 => {
                *state = EngineState::Draining(registry);
            }
            EngineState::Running(_) | EngineState::Idle => self.shared.bus.close(),
            previous @ (EngineState::Draining(_) | EngineState::Closed) => {
                *state = previous;
                return;
            }
        }
        drop(state);
        self.shutdown.cancel();
        self.shared.flow.close();
        tracing::info!(topic = %self.shared.config.topic, "reader closed");
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            *self.shared.lock(),
            EngineState::Draining(_) | EngineState::Closed
        )
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_pass(&self) {
        if let EngineState::Running(engine) = &mut *self.lock() {
            engine.pass(self.flow.as_ref());
        }
    }

    /// Returns false once the engine has nothing left to do.
    fn handle_notice(&self, notice: ConnectionNotice) -> bool {
        let mut state = self.lock();
        // Published under the lock so ordering matches registry updates.
        match &mut *state {
            EngineState::Running(engine) => {
                if let Some(event) = engine.registry.handle(notice) {
                    self.bus.publish(event);
                }
                true
            }
            EngineState::Draining(registry) => {
                if let Some(event) = registry.drain(notice) {
                    self.bus.publish(event);
                }
                if registry.len() > 0 {
                    return true;
                }
                *state = EngineState::Closed;
                self.bus.close();
                false
            }
            EngineState::Idle | EngineState::Closed => false,
        }
    }

    fn is_drained(&self) -> bool {
        matches!(*self.lock(), EngineState::Closed)
    }

    fn apply_lookup(&self, result: LookupResult) {
        if let EngineState::Running(engine) = &mut *self.lock() {
            Discovery::apply_lookup(result, &mut engine.registry);
        }
    }
}

impl Engine {
    fn pass(&mut self, flow: &dyn FlowControl) {
        self.discovery.run_pass(&mut self.registry, flow);
    }
}

fn ticker(delay: Duration, interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    // Intervals too large to schedule never fire.
    let start = Instant::now().checked_add(delay.saturating_add(interval))?;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_engine(
    shared: Arc<Shared>,
    mut notices: mpsc::UnboundedReceiver<ConnectionNotice>,
    mut lookups: mpsc::UnboundedReceiver<LookupResult>,
    mut ticker: Option<Interval>,
    shutdown: CancellationToken,
) {
    let mut closing = false;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled(), if !closing => {
                // Stop discovery; keep relaying `closed` until drained.
                closing = true;
                ticker = None;
                lookups.close();
                if shared.is_drained() {
                    break;
                }
            }
            notice = notices.recv() => match notice {
                Some(notice) => {
                    if !shared.handle_notice(notice) {
                        break;
                    }
                }
                None => break,
            },
            Some(result) = lookups.recv(), if !closing => shared.apply_lookup(result),
            _ = tick(&mut ticker), if !closing => shared.run_pass(),
        }
    }
    tracing::debug!("reader engine stopped");
}
