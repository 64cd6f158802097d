// Reader options, defaults, and validation into a resolved configuration.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::address::TargetAddress;
use crate::error::ConfigError;

pub const DEFAULT_MAX_IN_FLIGHT: u64 = 1;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_BACKOFF_DURATION_SECS: f64 = 128.0;
pub const DEFAULT_MAX_ATTEMPTS: u16 = 5;
pub const DEFAULT_REQUEUE_DELAY_SECS: u64 = 90;
pub const DEFAULT_LOOKUPD_POLL_INTERVAL_SECS: f64 = 60.0;
pub const DEFAULT_LOOKUPD_POLL_JITTER: f64 = 0.3;

/// Ordered list of addresses with nulls compacted away.
///
/// Deserializes from a single string, a list (which may contain nulls), or
/// nothing at all:
///
/// ```
/// use nsq_reader::ReaderOptions;
///
/// let options: ReaderOptions = serde_yaml::from_str(
///     "nsqd_tcp_addresses: 127.0.0.1:4150\nlookupd_http_addresses: [null, \"lookupd:4161\"]",
/// )
/// .expect("yaml");
/// assert_eq!(options.nsqd_tcp_addresses.as_slice(), ["127.0.0.1:4150"]);
/// assert_eq!(options.lookupd_http_addresses.as_slice(), ["lookupd:4161"]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawAddressList")]
pub struct AddressList(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAddressList {
    One(Option<String>),
    Many(Vec<Option<String>>),
}

impl From<RawAddressList> for AddressList {
    fn from(raw: RawAddressList) -> Self {
        match raw {
            RawAddressList::One(value) => value.into_iter().collect(),
            RawAddressList::Many(values) => values.into_iter().flatten().collect(),
        }
    }
}

impl FromIterator<String> for AddressList {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&str> for AddressList {
    fn from(value: &str) -> Self {
        Self(vec![value.to_string()])
    }
}

impl From<Vec<&str>> for AddressList {
    fn from(values: Vec<&str>) -> Self {
        values.into_iter().map(str::to_string).collect()
    }
}

impl From<Vec<Option<String>>> for AddressList {
    fn from(values: Vec<Option<String>>) -> Self {
        values.into_iter().flatten().collect()
    }
}

impl AddressList {
    /// Parse a comma separated list, as used by environment overrides.
    pub fn from_csv(value: &str) -> Self {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Caller supplied options; anything left as `None` (or empty) takes the
/// default during [`ReaderConfig::resolve`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ReaderOptions {
    pub name: Option<String>,
    pub max_in_flight: Option<u64>,
    /// Seconds.
    pub heartbeat_interval: Option<u64>,
    /// Seconds.
    pub max_backoff_duration: Option<f64>,
    pub max_attempts: Option<u16>,
    /// Seconds.
    pub requeue_delay: Option<u64>,
    #[serde(alias = "static_broker_addresses")]
    pub nsqd_tcp_addresses: AddressList,
    #[serde(alias = "discovery_addresses")]
    pub lookupd_http_addresses: AddressList,
    /// Seconds.
    #[serde(alias = "discovery_poll_interval")]
    pub lookupd_poll_interval: Option<f64>,
    #[serde(alias = "discovery_poll_jitter")]
    pub lookupd_poll_jitter: Option<f64>,
}

impl ReaderOptions {
    /// Read `NSQ_READER_*` environment variables, then overlay the YAML file
    /// named by `config_path` (or `NSQ_READER_CONFIG`) if there is one.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut options = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("NSQ_READER_CONFIG").ok());
        if let Some(path) = override_path {
            options.overlay(Self::from_yaml_file(&path)?);
        }
        Ok(options)
    }

    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read reader config: {path}"))?;
        serde_yaml::from_str(&contents).context("parse reader config yaml")
    }

    fn from_env() -> Self {
        Self {
            name: std::env::var("NSQ_READER_NAME").ok(),
            max_in_flight: read_env("NSQ_READER_MAX_IN_FLIGHT"),
            heartbeat_interval: read_env("NSQ_READER_HEARTBEAT_INTERVAL"),
            max_backoff_duration: read_env("NSQ_READER_MAX_BACKOFF_DURATION"),
            max_attempts: read_env("NSQ_READER_MAX_ATTEMPTS"),
            requeue_delay: read_env("NSQ_READER_REQUEUE_DELAY"),
            nsqd_tcp_addresses: read_list_env("NSQ_READER_NSQD_TCP_ADDRESSES"),
            lookupd_http_addresses: read_list_env("NSQ_READER_LOOKUPD_HTTP_ADDRESSES"),
            lookupd_poll_interval: read_env("NSQ_READER_LOOKUPD_POLL_INTERVAL"),
            lookupd_poll_jitter: read_env("NSQ_READER_LOOKUPD_POLL_JITTER"),
        }
    }

    /// Values set in `other` win over values set in `self`.
    pub fn overlay(&mut self, other: ReaderOptions) {
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.max_in_flight.is_some() {
            self.max_in_flight = other.max_in_flight;
        }
        if other.heartbeat_interval.is_some() {
            self.heartbeat_interval = other.heartbeat_interval;
        }
        if other.max_backoff_duration.is_some() {
            self.max_backoff_duration = other.max_backoff_duration;
        }
        if other.max_attempts.is_some() {
            self.max_attempts = other.max_attempts;
        }
        if other.requeue_delay.is_some() {
            self.requeue_delay = other.requeue_delay;
        }
        if !other.nsqd_tcp_addresses.is_empty() {
            self.nsqd_tcp_addresses = other.nsqd_tcp_addresses;
        }
        if !other.lookupd_http_addresses.is_empty() {
            self.lookupd_http_addresses = other.lookupd_http_addresses;
        }
        if other.lookupd_poll_interval.is_some() {
            self.lookupd_poll_interval = other.lookupd_poll_interval;
        }
        if other.lookupd_poll_jitter.is_some() {
            self.lookupd_poll_jitter = other.lookupd_poll_jitter;
        }
    }
}

/// Fully resolved, validated configuration. Read-only once built.
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    pub topic: String,
    pub channel: String,
    pub name: String,
    pub max_in_flight: u64,
    pub heartbeat_interval: Duration,
    pub max_backoff_duration: Duration,
    pub max_attempts: u16,
    pub requeue_delay: Duration,
    pub nsqd_tcp_addresses: Vec<TargetAddress>,
    pub lookupd_http_addresses: Vec<String>,
    pub lookupd_poll_interval: Duration,
    pub lookupd_poll_jitter: f64,
}

impl ReaderConfig {
    pub fn resolve(
        topic: impl Into<String>,
        channel: impl Into<String>,
        options: ReaderOptions,
    ) -> std::result::Result<Self, ConfigError> {
        let topic = topic.into();
        let channel = channel.into();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }

        let max_in_flight = options.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidMaxInFlight(max_in_flight));
        }

        let heartbeat_secs = options
            .heartbeat_interval
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);
        if heartbeat_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval(heartbeat_secs));
        }

        let max_backoff_secs = options
            .max_backoff_duration
            .unwrap_or(DEFAULT_MAX_BACKOFF_DURATION_SECS);
        if max_backoff_secs.is_nan() || max_backoff_secs <= 0.0 {
            return Err(ConfigError::InvalidMaxBackoffDuration(max_backoff_secs));
        }
        let max_backoff_duration = Duration::try_from_secs_f64(max_backoff_secs)
            .map_err(|_| ConfigError::InvalidMaxBackoffDuration(max_backoff_secs))?;

        let name = options
            .name
            .unwrap_or_else(|| format!("{topic}:{channel}"));

        let poll_secs = options
            .lookupd_poll_interval
            .unwrap_or(DEFAULT_LOOKUPD_POLL_INTERVAL_SECS);
        if poll_secs.is_nan() || poll_secs < 0.0 {
            return Err(ConfigError::InvalidLookupdPollInterval(poll_secs));
        }
        let lookupd_poll_interval = Duration::try_from_secs_f64(poll_secs)
            .map_err(|_| ConfigError::InvalidLookupdPollInterval(poll_secs))?;

        let lookupd_poll_jitter = options
            .lookupd_poll_jitter
            .unwrap_or(DEFAULT_LOOKUPD_POLL_JITTER);
        if !(0.0..=1.0).contains(&lookupd_poll_jitter) {
            return Err(ConfigError::InvalidLookupdPollJitter(lookupd_poll_jitter));
        }

        let nsqd_tcp_addresses = options
            .nsqd_tcp_addresses
            .as_slice()
            .iter()
            .map(|entry| {
                entry
                    .parse::<TargetAddress>()
                    .map_err(ConfigError::InvalidNsqdAddress)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let lookupd_http_addresses = options.lookupd_http_addresses.as_slice().to_vec();
        if nsqd_tcp_addresses.is_empty() && lookupd_http_addresses.is_empty() {
            return Err(ConfigError::NoAddressSource);
        }

        Ok(Self {
            topic,
            channel,
            name,
            max_in_flight,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_backoff_duration,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            requeue_delay: Duration::from_secs(
                options.requeue_delay.unwrap_or(DEFAULT_REQUEUE_DELAY_SECS),
            ),
            nsqd_tcp_addresses,
            lookupd_http_addresses,
            lookupd_poll_interval,
            lookupd_poll_jitter,
        })
    }

    /// One-time randomized delay before recurring passes begin. `sample` is
    /// expected in `[0, 1)`.
    pub fn startup_jitter(&self, sample: f64) -> Duration {
        self.lookupd_poll_interval
            .mul_f64(sample.clamp(0.0, 1.0) * self.lookupd_poll_jitter)
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn read_list_env(key: &str) -> AddressList {
    std::env::var(key)
        .map(|value| AddressList::from_csv(&value))
        .unwrap_or_default()
}
