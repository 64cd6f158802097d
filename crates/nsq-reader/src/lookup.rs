// Discovery transport: asks nsqlookupd which nsqd nodes carry a topic.
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(20);

/// One nsqd node advertised for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Producer {
    pub broadcast_address: String,
    pub tcp_port: u16,
}

#[async_trait]
pub trait LookupClient: Send + Sync {
    async fn lookup(&self, endpoint: &str, topic: &str) -> Result<Vec<Producer>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    // nsqlookupd before 1.0 wrapped the payload in `data`.
    Legacy { data: ProducerList },
    Current(ProducerList),
}

#[derive(Debug, Deserialize)]
struct ProducerList {
    #[serde(default)]
    producers: Vec<Producer>,
}

impl LookupResponse {
    fn into_producers(self) -> Vec<Producer> {
        match self {
            Self::Legacy { data } => data.producers,
            Self::Current(list) => list.producers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpLookup {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLookup {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LookupClient for HttpLookup {
    async fn lookup(&self, endpoint: &str, topic: &str) -> Result<Vec<Producer>> {
        let url = lookup_url(endpoint, topic)?;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .context("lookup request")?
            .error_for_status()
            .context("lookup status")?;
        let body: LookupResponse = response.json().await.context("lookup body")?;
        Ok(body.into_producers())
    }
}

/// Builds the query URL for an nsqlookupd endpoint.
///
/// Bare `host:port` endpoints get an `http://` scheme and endpoints without a
/// path get `/lookup`.
pub fn lookup_url(endpoint: &str, topic: &str) -> Result<reqwest::Url> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };
    let mut url = reqwest::Url::parse(&with_scheme)
        .with_context(|| format!("invalid lookupd address {endpoint:?}"))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/lookup");
    }
    url.query_pairs_mut().append_pair("topic", topic);
    Ok(url)
}
