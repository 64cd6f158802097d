// Flow control: who may receive how many in-flight messages, and when.
//
// The reader hands every connection it creates to a `FlowControl` and reports
// lifecycle changes to it. All methods are synchronous and must not block;
// they are called while the engine lock is held.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::address::ConnectionId;
use crate::connection::Connection;

// 2^MAX_BACKOFF_EXPONENT seconds already exceeds any sane ceiling.
const MAX_BACKOFF_EXPONENT: u32 = 16;

pub trait FlowControl: Send + Sync {
    fn add_connection(&self, connection: Arc<dyn Connection>);

    fn connection_ready(&self, id: &ConnectionId);

    fn connection_error(&self, id: &ConnectionId);

    fn remove_connection(&self, id: &ConnectionId);

    fn pause(&self);

    fn unpause(&self);

    fn is_paused(&self) -> bool;

    /// Close every registered connection, and any registered afterwards.
    fn close(&self);
}

/// Splits `max_in_flight` evenly over ready connections and backs off
/// exponentially after connection errors.
///
/// ```
/// use nsq_reader::{FlowControl, ReadyBalancer};
/// use std::time::Duration;
///
/// let balancer = ReadyBalancer::new(10, Duration::from_secs(128));
/// balancer.pause();
/// assert!(balancer.is_paused());
/// balancer.unpause();
/// assert!(!balancer.is_paused());
/// ```
#[derive(Clone)]
pub struct ReadyBalancer {
    max_in_flight: u64,
    max_backoff: Duration,
    state: Arc<Mutex<BalancerState>>,
}

#[derive(Default)]
struct BalancerState {
    connections: BTreeMap<ConnectionId, Tracked>,
    paused: bool,
    closed: bool,
    backoff_level: u32,
    backing_off: bool,
    // Bumped on each new backoff so stale timers do nothing.
    backoff_epoch: u64,
}

struct Tracked {
    connection: Arc<dyn Connection>,
    ready: bool,
    rdy: u64,
}

impl ReadyBalancer {
    pub fn new(max_in_flight: u64, max_backoff: Duration) -> Self {
        Self {
            max_in_flight,
            max_backoff,
            state: Arc::new(Mutex::new(BalancerState::default())),
        }
    }

    pub fn max_in_flight(&self) -> u64 {
        self.max_in_flight
    }

    /// Delay applied for the given backoff level (1-based).
    pub fn backoff_delay(&self, level: u32) -> Duration {
        let exponent = level.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        Duration::from_secs(1u64 << exponent).min(self.max_backoff)
    }

    pub fn is_backing_off(&self) -> bool {
        self.lock().backing_off
    }

    /// Current RDY count sent to a connection, if it is registered.
    pub fn ready_count(&self, id: &ConnectionId) -> Option<u64> {
        self.lock().connections.get(id).map(|tracked| tracked.rdy)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rebalance(&self, state: &mut BalancerState) {
        let ready = state.connections.values().filter(|t| t.ready).count() as u64;
        let throttled = state.paused || state.closed || state.backing_off;
        let (base, mut extra) = if throttled || ready == 0 {
            (0, 0)
        } else if self.max_in_flight < ready {
            (1, 0)
        } else {
            (self.max_in_flight / ready, self.max_in_flight % ready)
        };
        for tracked in state.connections.values_mut().filter(|t| t.ready) {
            let mut target = base;
            if extra > 0 {
                target += 1;
                extra -= 1;
            }
            if tracked.rdy != target {
                tracked.rdy = target;
                tracked.connection.set_ready(target);
            }
        }
    }

    fn start_backoff(&self, state: &mut BalancerState) {
        state.backoff_level = (state.backoff_level + 1).min(MAX_BACKOFF_EXPONENT + 1);
        let delay = self.backoff_delay(state.backoff_level);
        state.backing_off = true;
        state.backoff_epoch += 1;
        let epoch = state.backoff_epoch;
        self.rebalance(state);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, backoff will not expire");
            return;
        };
        tracing::debug!(level = state.backoff_level, ?delay, "entering backoff");
        let balancer = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = balancer.lock();
            if state.closed || state.backoff_epoch != epoch {
                return;
            }
            state.backing_off = false;
            balancer.rebalance(&mut state);
        });
    }
}

impl FlowControl for ReadyBalancer {
    fn add_connection(&self, connection: Arc<dyn Connection>) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            connection.close();
            return;
        }
        let id = connection.address().connection_id();
        state.connections.insert(
            id,
            Tracked {
                connection,
                ready: false,
                rdy: 0,
            },
        );
    }

    fn connection_ready(&self, id: &ConnectionId) {
        let mut state = self.lock();
        let Some(tracked) = state.connections.get_mut(id) else {
            return;
        };
        tracked.ready = true;
        state.backoff_level = 0;
        self.rebalance(&mut state);
    }

    fn connection_error(&self, id: &ConnectionId) {
        let mut state = self.lock();
        if state.closed || !state.connections.contains_key(id) {
            return;
        }
        self.start_backoff(&mut state);
    }

    fn remove_connection(&self, id: &ConnectionId) {
        let mut state = self.lock();
        if state.connections.remove(id).is_some() {
            self.rebalance(&mut state);
        }
    }

    fn pause(&self) {
        let mut state = self.lock();
        state.paused = true;
        self.rebalance(&mut state);
    }

    fn unpause(&self) {
        let mut state = self.lock();
        state.paused = false;
        self.rebalance(&mut state);
    }

    fn is_paused(&self) -> bool {
        self.lock().paused
    }

    fn close(&self) {
        let connections: Vec<Arc<dyn Connection>> = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.connections)
                .into_values()
                .map(|tracked| tracked.connection)
                .collect()
        };
        for connection in connections {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::TargetAddress;
    use crate::error::ConnectionError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Recording {
        address: TargetAddress,
        ready: Mutex<Vec<u64>>,
        closed: AtomicBool,
    }

    impl Recording {
        fn new(port: u16) -> Arc<Self> {
            Arc::new(Self {
                address: TargetAddress::new("nsqd", port),
                ready: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn last_ready(&self) -> Option<u64> {
            self.ready.lock().expect("lock").last().copied()
        }

        fn id(&self) -> ConnectionId {
            self.address.connection_id()
        }
    }

    #[async_trait]
    impl Connection for Recording {
        fn address(&self) -> &TargetAddress {
            &self.address
        }

        async fn connect(&self) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn set_ready(&self, count: u64) {
            self.ready.lock().expect("lock").push(count);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn ready_all(balancer: &ReadyBalancer, connections: &[Arc<Recording>]) {
        for connection in connections {
            balancer.add_connection(connection.clone());
            balancer.connection_ready(&connection.id());
        }
    }

    #[test]
    fn splits_budget_over_ready_connections() {
        let balancer = ReadyBalancer::new(5, Duration::from_secs(128));
        let connections = [Recording::new(1), Recording::new(2)];
        ready_all(&balancer, &connections);
        assert_eq!(connections[0].last_ready(), Some(3));
        assert_eq!(connections[1].last_ready(), Some(2));

        balancer.remove_connection(&connections[1].id());
        assert_eq!(connections[0].last_ready(), Some(5));
        assert_eq!(balancer.ready_count(&connections[1].id()), None);
    }

    #[test]
    fn every_connection_gets_at_least_one() {
        let balancer = ReadyBalancer::new(1, Duration::from_secs(128));
        let connections = [Recording::new(1), Recording::new(2), Recording::new(3)];
        ready_all(&balancer, &connections);
        for connection in &connections {
            assert_eq!(connection.last_ready(), Some(1));
        }
    }

    #[test]
    fn connections_get_nothing_until_ready() {
        let balancer = ReadyBalancer::new(4, Duration::from_secs(128));
        let connection = Recording::new(1);
        balancer.add_connection(connection.clone());
        assert_eq!(connection.last_ready(), None);
        assert_eq!(balancer.ready_count(&connection.id()), Some(0));
    }

    #[test]
    fn pause_zeroes_and_unpause_restores() {
        let balancer = ReadyBalancer::new(4, Duration::from_secs(128));
        let connection = Recording::new(1);
        ready_all(&balancer, std::slice::from_ref(&connection));
        balancer.pause();
        assert!(balancer.is_paused());
        assert_eq!(connection.last_ready(), Some(0));
        balancer.unpause();
        assert!(!balancer.is_paused());
        assert_eq!(connection.last_ready(), Some(4));
    }

    #[test]
    fn backoff_delay_is_capped() {
        let balancer = ReadyBalancer::new(1, Duration::from_secs(10));
        assert_eq!(balancer.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(balancer.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(balancer.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(balancer.backoff_delay(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn error_backs_off_then_restores() {
        let balancer = ReadyBalancer::new(2, Duration::from_secs(128));
        let connection = Recording::new(1);
        ready_all(&balancer, std::slice::from_ref(&connection));
        assert_eq!(connection.last_ready(), Some(2));

        balancer.connection_error(&connection.id());
        assert!(balancer.is_backing_off());
        assert_eq!(connection.last_ready(), Some(0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(connection.last_ready(), Some(0));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!balancer.is_backing_off());
        assert_eq!(connection.last_ready(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_errors_grow_backoff() {
        let balancer = ReadyBalancer::new(2, Duration::from_secs(128));
        let connection = Recording::new(1);
        ready_all(&balancer, std::slice::from_ref(&connection));

        balancer.connection_error(&connection.id());
        balancer.connection_error(&connection.id());
        // Second error supersedes the first timer with a 2s backoff.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(balancer.is_backing_off());
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!balancer.is_backing_off());
        assert_eq!(connection.last_ready(), Some(2));
    }

    #[test]
    fn close_closes_current_and_later_connections() {
        let balancer = ReadyBalancer::new(2, Duration::from_secs(128));
        let current = Recording::new(1);
        ready_all(&balancer, std::slice::from_ref(&current));
        balancer.close();
        assert!(current.closed.load(Ordering::SeqCst));

        let late = Recording::new(2);
        balancer.add_connection(late.clone());
        assert!(late.closed.load(Ordering::SeqCst));
        assert_eq!(balancer.ready_count(&late.id()), None);
    }
}
