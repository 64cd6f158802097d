// Public event surface of a reader.
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::address::TargetAddress;
use crate::connection::Message;
use crate::error::ConnectionError;

#[derive(Clone, Debug)]
pub enum ReaderEvent {
    /// A connection reported an error. Discovery and other connections keep
    /// running.
    Error {
        address: TargetAddress,
        error: Arc<ConnectionError>,
    },
    /// Deliverable message (attempts below `max_attempts`).
    Message(Message),
    /// Message that reached `max_attempts`. Not an error.
    Discard(Message),
    NsqdConnected { host: String, port: u16 },
    NsqdClosed { host: String, port: u16 },
}

/// Fan-out of `ReaderEvent`s to every registered `EventStream`.
#[derive(Default)]
pub(crate) struct EventBus {
    listeners: Mutex<Vec<mpsc::UnboundedSender<ReaderEvent>>>,
    closed: AtomicBool,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.closed.load(Ordering::SeqCst) {
            listeners.push(tx);
        }
        EventStream { rx }
    }

    pub(crate) fn publish(&self, event: ReaderEvent) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Dropped streams are pruned on the next publish.
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Ends every registered stream. Later subscribers get a stream that is
    /// already finished.
    pub(crate) fn close(&self) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.clear();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Receiving half of a reader subscription, obtained from `Reader::events`.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ReaderEvent>,
}

impl EventStream {
    /// Waits for the next event. Returns `None` once the reader has closed and
    /// every connection it tracked has reported `NsqdClosed`.
    pub async fn next(&mut self) -> Option<ReaderEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<ReaderEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ReaderEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
