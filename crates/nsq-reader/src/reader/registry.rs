// Deduplicated set of live nsqd connections.
//
// An id is tracked from the moment a connect attempt starts until the
// registry observes the matching `closed` notice; that notice is the only
// untrack path. Each tracked id carries the generation of the connection that
// owns it so a stray notice from an older connection cannot untrack a newer
// one.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::router;
use crate::address::{ConnectionId, TargetAddress};
use crate::config::ReaderConfig;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionNotice, ConnectionParams, EventSink,
};
use crate::events::ReaderEvent;
use crate::flow::FlowControl;

pub(crate) struct ConnectionRegistry {
    topic: String,
    channel: String,
    client_id: String,
    heartbeat_interval: Duration,
    requeue_delay: Duration,
    max_attempts: u16,
    factory: Arc<dyn ConnectionFactory>,
    flow: Arc<dyn FlowControl>,
    notices: mpsc::UnboundedSender<ConnectionNotice>,
    tracked: HashMap<ConnectionId, u64>,
    next_generation: u64,
}

impl ConnectionRegistry {
    pub(crate) fn new(
        config: &ReaderConfig,
        factory: Arc<dyn ConnectionFactory>,
        flow: Arc<dyn FlowControl>,
        notices: mpsc::UnboundedSender<ConnectionNotice>,
    ) -> Self {
        Self {
            topic: config.topic.clone(),
            channel: config.channel.clone(),
            client_id: config.name.clone(),
            heartbeat_interval: config.heartbeat_interval,
            requeue_delay: config.requeue_delay,
            max_attempts: config.max_attempts,
            factory,
            flow,
            notices,
            tracked: HashMap::new(),
            next_generation: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tracked.len()
    }

    /// Start a connection to `address` unless one is already tracked.
    ///
    /// Returns whether a new connect attempt was started. Must run inside a
    /// tokio runtime.
    pub(crate) fn submit(&mut self, address: TargetAddress) -> bool {
        let id = address.connection_id();
        if self.tracked.contains_key(&id) {
            return false;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.tracked.insert(id, generation);
        metrics::gauge!("nsq_reader_connections").set(self.tracked.len() as f64);

        let sink = EventSink::new(address.clone(), generation, self.notices.clone());
        let connection = self.factory.create(
            ConnectionParams {
                address: address.clone(),
                topic: self.topic.clone(),
                channel: self.channel.clone(),
                client_id: self.client_id.clone(),
                heartbeat_interval: self.heartbeat_interval,
                requeue_delay: self.requeue_delay,
            },
            sink.clone(),
        );
        self.flow.add_connection(connection.clone());

        tracing::debug!(address = %address, generation, "connecting to nsqd");
        tokio::spawn(async move {
            if let Err(err) = connection.connect().await {
                tracing::warn!(address = %address, error = %err, "nsqd connect failed");
                sink.error(err);
                sink.closed();
            }
        });
        true
    }

    /// Apply the internal side of a connection notice and return the event to
    /// publish for it, if any.
    pub(crate) fn handle(&mut self, notice: ConnectionNotice) -> Option<ReaderEvent> {
        let ConnectionNotice {
            id,
            generation,
            address,
            event,
        } = notice;
        let current = self.tracked.get(&id) == Some(&generation);
        match event {
            ConnectionEvent::Connected => {
                if !current {
                    tracing::debug!(address = %address, generation, "ignoring stale connected");
                    return None;
                }
                self.flow.connection_ready(&id);
                tracing::info!(address = %address, "nsqd connected");
                Some(ReaderEvent::NsqdConnected {
                    host: address.host,
                    port: address.port,
                })
            }
            ConnectionEvent::Error(error) => {
                if current {
                    self.flow.connection_error(&id);
                }
                Some(ReaderEvent::Error {
                    address,
                    error: Arc::new(error),
                })
            }
            ConnectionEvent::Message(message) => Some(router::route(message, self.max_attempts)),
            ConnectionEvent::Closed => {
                if !current {
                    tracing::debug!(address = %address, generation, "ignoring stale closed");
                    return None;
                }
                self.tracked.remove(&id);
                self.flow.remove_connection(&id);
                metrics::gauge!("nsq_reader_connections").set(self.tracked.len() as f64);
                tracing::info!(address = %address, "nsqd closed");
                Some(ReaderEvent::NsqdClosed {
                    host: address.host,
                    port: address.port,
                })
            }
        }
    }

    /// Notice handling once the reader is closing: only the `closed` relay of
    /// tracked connections still runs.
    pub(crate) fn drain(&mut self, notice: ConnectionNotice) -> Option<ReaderEvent> {
        match notice.event {
            ConnectionEvent::Closed => self.handle(notice),
            ConnectionEvent::Connected
            | ConnectionEvent::Error(_)
            | ConnectionEvent::Message(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderOptions;
    use crate::error::ConnectionError;
    use crate::flow::ReadyBalancer;
    use async_trait::async_trait;

    // Never finishes connecting, so only hand-made notices reach the registry.
    struct Stalled(TargetAddress);

    #[async_trait]
    impl Connection for Stalled {
        fn address(&self) -> &TargetAddress {
            &self.0
        }

        async fn connect(&self) -> Result<(), ConnectionError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn set_ready(&self, _count: u64) {}

        fn close(&self) {}
    }

    struct StalledFactory;

    impl ConnectionFactory for StalledFactory {
        fn create(&self, params: ConnectionParams, _events: EventSink) -> Arc<dyn Connection> {
            Arc::new(Stalled(params.address))
        }
    }

    fn registry() -> (ConnectionRegistry, mpsc::UnboundedReceiver<ConnectionNotice>) {
        let config = ReaderConfig::resolve(
            "orders",
            "billing",
            ReaderOptions {
                nsqd_tcp_addresses: "nsqd-1:4150".into(),
                ..Default::default()
            },
        )
        .expect("config");
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = Arc::new(ReadyBalancer::new(1, Duration::from_secs(1)));
        (
            ConnectionRegistry::new(&config, Arc::new(StalledFactory), flow, tx),
            rx,
        )
    }

    fn notice(address: &TargetAddress, generation: u64, event: ConnectionEvent) -> ConnectionNotice {
        ConnectionNotice {
            id: address.connection_id(),
            generation,
            address: address.clone(),
            event,
        }
    }

    #[tokio::test]
    async fn submit_is_deduplicated_until_closed() {
        let (mut registry, _rx) = registry();
        let address = TargetAddress::new("nsqd-1", 4150);
        assert!(registry.submit(address.clone()));
        assert!(!registry.submit(address.clone()));
        assert_eq!(registry.len(), 1);

        let event = registry.handle(notice(&address, 1, ConnectionEvent::Closed));
        assert!(matches!(event, Some(ReaderEvent::NsqdClosed { port: 4150, .. })));
        assert_eq!(registry.len(), 0);
        assert!(registry.submit(address));
    }

    #[tokio::test]
    async fn stale_generation_cannot_untrack() {
        let (mut registry, _rx) = registry();
        let address = TargetAddress::new("nsqd-1", 4150);
        assert!(registry.submit(address.clone()));

        assert!(registry
            .handle(notice(&address, 0, ConnectionEvent::Closed))
            .is_none());
        assert!(registry
            .handle(notice(&address, 0, ConnectionEvent::Connected))
            .is_none());
        assert_eq!(registry.len(), 1);

        // Errors are published whatever their generation.
        let event = registry.handle(notice(
            &address,
            0,
            ConnectionEvent::Error(ConnectionError::Closed),
        ));
        assert!(matches!(event, Some(ReaderEvent::Error { .. })));
    }

    #[tokio::test]
    async fn draining_relays_only_closed() {
        let (mut registry, _rx) = registry();
        let address = TargetAddress::new("nsqd-1", 4150);
        assert!(registry.submit(address.clone()));

        assert!(registry
            .drain(notice(&address, 1, ConnectionEvent::Connected))
            .is_none());
        assert!(registry
            .drain(notice(
                &address,
                1,
                ConnectionEvent::Error(ConnectionError::Closed)
            ))
            .is_none());
        let event = registry.drain(notice(&address, 1, ConnectionEvent::Closed));
        assert!(matches!(event, Some(ReaderEvent::NsqdClosed { port: 4150, .. })));
        assert_eq!(registry.len(), 0);
    }
}
