// Broker addresses and the dedup key derived from them.
use std::fmt;
use std::str::FromStr;

/// A broker node to connect to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId(self.to_string())
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TargetAddress {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (host, port) = input
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| input.to_string())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(input.to_string());
        }
        let port = port.parse::<u16>().map_err(|_| input.to_string())?;
        Ok(Self::new(host, port))
    }
}

/// Canonical `host:port` key used to deduplicate connections.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
