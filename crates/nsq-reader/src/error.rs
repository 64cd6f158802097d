use thiserror::Error;

/// Construction-time validation failures. Each rule has its own variant.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("topic must be a non-empty string")]
    EmptyTopic,
    #[error("max_in_flight must be a positive number, got {0}")]
    InvalidMaxInFlight(u64),
    #[error("heartbeat_interval must be a positive number, got {0}")]
    InvalidHeartbeatInterval(u64),
    #[error("max_backoff_duration must be a number greater than 0, got {0}")]
    InvalidMaxBackoffDuration(f64),
    #[error("lookupd_poll_interval must be a non-negative number, got {0}")]
    InvalidLookupdPollInterval(f64),
    #[error("lookupd_poll_jitter must be a number in [0, 1], got {0}")]
    InvalidLookupdPollJitter(f64),
    #[error("invalid nsqd address {0:?}, expected host:port")]
    InvalidNsqdAddress(String),
    #[error("nsqd_tcp_addresses or lookupd_http_addresses must be set")]
    NoAddressSource,
}

/// Lifecycle misuse of a `Reader`.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("reader is already connected")]
    AlreadyConnected,
    #[error("reader is closed")]
    Closed,
    #[error("connect must be called from within a tokio runtime")]
    NoRuntime,
}

/// Failures reported by a single broker connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] nsq_wire::Error),
    #[error("nsqd rejected {context}: {message}")]
    Rejected {
        context: &'static str,
        message: String,
    },
    #[error("unexpected frame during {0}")]
    UnexpectedFrame(&'static str),
    #[error("connection closed")]
    Closed,
}
