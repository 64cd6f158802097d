// Produces candidate nsqd targets, either from the static list or by asking
// nsqlookupd, and feeds them to the registry.
use std::sync::Arc;
use tokio::sync::mpsc;

use super::registry::ConnectionRegistry;
use crate::address::TargetAddress;
use crate::config::ReaderConfig;
use crate::flow::FlowControl;
use crate::lookup::{LookupClient, Producer};
use crate::round_robin::RoundRobin;

/// How a reader finds nsqd nodes. Fixed when the reader is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Connect to the configured `nsqd_tcp_addresses`.
    Direct,
    /// Poll `lookupd_http_addresses` for producers of the topic.
    Lookupd,
}

impl DiscoveryMode {
    /// Static addresses win when both sources are configured.
    pub fn for_config(config: &ReaderConfig) -> Self {
        if config.nsqd_tcp_addresses.is_empty() {
            Self::Lookupd
        } else {
            Self::Direct
        }
    }
}

pub(crate) struct LookupResult {
    pub(crate) endpoint: String,
    pub(crate) producers: anyhow::Result<Vec<Producer>>,
}

pub(crate) enum Discovery {
    Direct {
        addresses: Vec<TargetAddress>,
    },
    Lookupd {
        topic: String,
        endpoints: RoundRobin<String>,
        client: Arc<dyn LookupClient>,
        results: mpsc::UnboundedSender<LookupResult>,
    },
}

impl Discovery {
    pub(crate) fn new(
        config: &ReaderConfig,
        client: Arc<dyn LookupClient>,
        results: mpsc::UnboundedSender<LookupResult>,
    ) -> Self {
        match DiscoveryMode::for_config(config) {
            DiscoveryMode::Direct => Self::Direct {
                addresses: config.nsqd_tcp_addresses.clone(),
            },
            DiscoveryMode::Lookupd => Self::Lookupd {
                topic: config.topic.clone(),
                endpoints: RoundRobin::new(config.lookupd_http_addresses.clone()),
                client,
                results,
            },
        }
    }

    /// One discovery pass. No-op while paused.
    pub(crate) fn run_pass(&mut self, registry: &mut ConnectionRegistry, flow: &dyn FlowControl) {
        if flow.is_paused() {
            tracing::debug!("reader paused, skipping discovery pass");
            return;
        }
        match self {
            Self::Direct { addresses } => {
                // Count based: a dropped node is only retried once the tracked
                // count falls below the configured count.
                if registry.len() < addresses.len() {
                    for address in addresses.iter() {
                        registry.submit(address.clone());
                    }
                }
            }
            Self::Lookupd {
                topic,
                endpoints,
                client,
                results,
            } => {
                let Some(endpoint) = endpoints.next().cloned() else {
                    return;
                };
                let client = client.clone();
                let results = results.clone();
                let topic = topic.clone();
                tokio::spawn(async move {
                    let producers = client.lookup(&endpoint, &topic).await;
                    let _ = results.send(LookupResult {
                        endpoint,
                        producers,
                    });
                });
            }
        }
    }

    /// Submit every producer from a finished lookup. Failures are logged and
    /// dropped; the next pass tries the next endpoint.
    pub(crate) fn apply_lookup(result: LookupResult, registry: &mut ConnectionRegistry) {
        match result.producers {
            Ok(producers) => {
                tracing::debug!(
                    endpoint = %result.endpoint,
                    producers = producers.len(),
                    "lookupd answered"
                );
                for producer in producers {
                    registry.submit(TargetAddress::new(
                        producer.broadcast_address,
                        producer.tcp_port,
                    ));
                }
            }
            Err(err) => {
                metrics::counter!("nsq_reader_lookup_failures_total").increment(1);
                tracing::warn!(
                    endpoint = %result.endpoint,
                    error = %format_args!("{err:#}"),
                    "lookupd query failed"
                );
            }
        }
    }
}
