// Attempt-based routing of inbound messages.
use crate::connection::Message;
use crate::events::ReaderEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Deliver,
    Discard,
}

/// A message is delivered while its attempt count is below `max_attempts`.
pub fn classify(attempts: u16, max_attempts: u16) -> Route {
    if attempts < max_attempts {
        Route::Deliver
    } else {
        Route::Discard
    }
}

pub(crate) fn route(message: Message, max_attempts: u16) -> ReaderEvent {
    match classify(message.attempts(), max_attempts) {
        Route::Deliver => {
            metrics::counter!("nsq_reader_messages_total").increment(1);
            ReaderEvent::Message(message)
        }
        Route::Discard => {
            metrics::counter!("nsq_reader_discarded_total").increment(1);
            tracing::debug!(
                id = %message.id(),
                attempts = message.attempts(),
                max_attempts,
                "discarding message"
            );
            ReaderEvent::Discard(message)
        }
    }
}
