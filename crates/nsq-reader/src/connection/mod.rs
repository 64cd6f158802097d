// Broker connection contract consumed by the registry.
//
// The reader never speaks the protocol itself. It asks a `ConnectionFactory`
// for a connection, hands it an `EventSink` to report on, and relies on the
// following contract:
//
// - `connect()` resolves once the connection is subscribed. On success the
//   connection must already have emitted `connected`, and it must emit
//   exactly one `closed` at some later point.
// - if `connect()` fails the connection emits nothing further; the registry
//   relays the returned error and a `closed` on its behalf.
// - `message` events carry a `Message` that the application answers with
//   `finish`, `requeue` or `touch`.
use async_trait::async_trait;
use bytes::Bytes;
use nsq_wire::MessageId;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::address::{ConnectionId, TargetAddress};
use crate::error::ConnectionError;

pub mod codec;
pub mod tcp;

#[async_trait]
pub trait Connection: Send + Sync {
    fn address(&self) -> &TargetAddress;

    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Update how many messages the broker may push before the next update.
    fn set_ready(&self, count: u64);

    /// Ungraceful close; in-flight messages are not drained.
    fn close(&self);
}

pub trait ConnectionFactory: Send + Sync {
    fn create(&self, params: ConnectionParams, events: EventSink) -> Arc<dyn Connection>;
}

/// Everything a connection needs to subscribe on behalf of the reader.
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    pub address: TargetAddress,
    pub topic: String,
    pub channel: String,
    pub client_id: String,
    pub heartbeat_interval: Duration,
    pub requeue_delay: Duration,
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Error(ConnectionError),
    Message(Message),
    Closed,
}

/// Event tagged with the connection generation that produced it.
#[derive(Debug)]
pub(crate) struct ConnectionNotice {
    pub(crate) id: ConnectionId,
    pub(crate) generation: u64,
    pub(crate) address: TargetAddress,
    pub(crate) event: ConnectionEvent,
}

/// Handle a connection uses to report lifecycle and message events.
///
/// Sends never block and are silently dropped once the reader has shut down.
#[derive(Clone, Debug)]
pub struct EventSink {
    id: ConnectionId,
    generation: u64,
    address: TargetAddress,
    tx: mpsc::UnboundedSender<ConnectionNotice>,
}

impl EventSink {
    pub(crate) fn new(
        address: TargetAddress,
        generation: u64,
        tx: mpsc::UnboundedSender<ConnectionNotice>,
    ) -> Self {
        Self {
            id: address.connection_id(),
            generation,
            address,
            tx,
        }
    }

    pub fn connected(&self) {
        self.emit(ConnectionEvent::Connected);
    }

    pub fn error(&self, error: ConnectionError) {
        self.emit(ConnectionEvent::Error(error));
    }

    pub fn message(&self, message: Message) {
        self.emit(ConnectionEvent::Message(message));
    }

    pub fn closed(&self) {
        self.emit(ConnectionEvent::Closed);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(ConnectionNotice {
            id: self.id.clone(),
            generation: self.generation,
            address: self.address.clone(),
            event,
        });
    }
}

/// Application answer to a delivered message, written back by the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageResponse {
    Finish(MessageId),
    Requeue { id: MessageId, delay: Duration },
    Touch(MessageId),
}

impl MessageResponse {
    pub fn into_command(self) -> nsq_wire::Command {
        match self {
            Self::Finish(id) => nsq_wire::Command::Fin(id),
            Self::Requeue { id, delay } => nsq_wire::Command::Req {
                id,
                delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
            },
            Self::Touch(id) => nsq_wire::Command::Touch(id),
        }
    }
}

/// Inbound message. Cheap to clone; all clones share the response state, so
/// only the first `finish`/`requeue` is sent.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

struct MessageInner {
    raw: nsq_wire::Message,
    address: TargetAddress,
    default_requeue_delay: Duration,
    responder: Option<mpsc::UnboundedSender<MessageResponse>>,
    responded: AtomicBool,
}

impl Message {
    pub fn new(
        raw: nsq_wire::Message,
        address: TargetAddress,
        default_requeue_delay: Duration,
        responder: mpsc::UnboundedSender<MessageResponse>,
    ) -> Self {
        Self::build(raw, address, default_requeue_delay, Some(responder))
    }

    /// Message with nowhere to send responses; `finish`/`requeue` only flip
    /// the responded flag.
    pub fn detached(raw: nsq_wire::Message, address: TargetAddress) -> Self {
        Self::build(raw, address, Duration::ZERO, None)
    }

    fn build(
        raw: nsq_wire::Message,
        address: TargetAddress,
        default_requeue_delay: Duration,
        responder: Option<mpsc::UnboundedSender<MessageResponse>>,
    ) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                raw,
                address,
                default_requeue_delay,
                responder,
                responded: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> MessageId {
        self.inner.raw.id
    }

    pub fn attempts(&self) -> u16 {
        self.inner.raw.attempts
    }

    pub fn timestamp(&self) -> i64 {
        self.inner.raw.timestamp
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.raw.body
    }

    /// Broker that delivered this message.
    pub fn address(&self) -> &TargetAddress {
        &self.inner.address
    }

    pub fn has_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Acknowledge successful processing. Returns `false` if the message was
    /// already answered.
    pub fn finish(&self) -> bool {
        self.respond(MessageResponse::Finish(self.id()))
    }

    /// Hand the message back to the broker, using the connection's configured
    /// requeue delay when `delay` is `None`.
    pub fn requeue(&self, delay: Option<Duration>) -> bool {
        let delay = delay.unwrap_or(self.inner.default_requeue_delay);
        self.respond(MessageResponse::Requeue {
            id: self.id(),
            delay,
        })
    }

    /// Reset the broker-side timeout without answering.
    pub fn touch(&self) -> bool {
        if self.has_responded() {
            return false;
        }
        self.send(MessageResponse::Touch(self.id()));
        true
    }

    fn respond(&self, response: MessageResponse) -> bool {
        if self.inner.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.send(response);
        true
    }

    fn send(&self, response: MessageResponse) {
        if let Some(responder) = &self.inner.responder {
            let _ = responder.send(response);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("attempts", &self.attempts())
            .field("address", &self.inner.address)
            .field("body_len", &self.inner.raw.body.len())
            .finish()
    }
}
