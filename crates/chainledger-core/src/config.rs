//! Configuration for scanning, publishing and the admin surface.

use serde::{Deserialize, Serialize};

use crate::types::{BlockNumber, ChainId};

/// Factory discovery: where new contract instances come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Factory contract addresses.
    #[serde(default)]
    pub factories: Vec<String>,
    /// Deployment event signature (topic0).
    #[serde(default)]
    pub deployment_signature: String,
    /// Index of the indexed topic carrying the new instance address.
    #[serde(default = "default_address_topic")]
    pub address_topic: usize,
}

fn default_address_topic() -> usize {
    1
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            factories: vec![],
            deployment_signature: String::new(),
            address_topic: default_address_topic(),
        }
    }
}

impl DiscoveryConfig {
    pub fn is_enabled(&self) -> bool {
        !self.factories.is_empty() && !self.deployment_signature.is_empty()
    }
}

/// Configuration for one chain's scan loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub chain_id: ChainId,
    /// First block to scan when no checkpoint exists.
    pub start_block: BlockNumber,
    /// Blocks per cycle.
    pub batch_size: u64,
    /// Delay between cycles (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum concurrent per-instance queries.
    pub concurrency: usize,
    /// Provider timeout for a single query (milliseconds).
    pub query_timeout_ms: u64,
    /// Deadline for a whole cycle (milliseconds).
    pub cycle_deadline_ms: u64,
    /// Blocks re-queried below the checkpoint on the first cycle after start.
    pub reorg_overlap: u64,
    /// Largest block span a single `getLogs` call may cover.
    pub max_log_range: u64,
    pub discovery: DiscoveryConfig,
    /// Lifecycle event signatures queried on each instance (empty = all).
    pub lifecycle_signatures: Vec<String>,
    /// Bus topic for published events.
    pub topic: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            start_block: 0,
            batch_size: 100,
            poll_interval_ms: 2000,
            concurrency: 10,
            query_timeout_ms: 10_000,
            cycle_deadline_ms: 60_000,
            reorg_overlap: 0,
            max_log_range: 2000,
            discovery: DiscoveryConfig::default(),
            lifecycle_signatures: vec![],
            topic: "chain-events".into(),
        }
    }
}

/// Publisher retry behaviour for transient bus errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Attempts per event before the batch fails.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Queue depth of the publisher task.
    pub queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            queue_capacity: 64,
        }
    }
}

/// Operator control surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Shared secret required for force-set; `None` disables the check.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: ScannerConfig =
            serde_json::from_str(r#"{"chain_id": 10, "batch_size": 500}"#).unwrap();
        assert_eq!(cfg.chain_id, 10);
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.concurrency, 10);
        assert_eq!(cfg.discovery.address_topic, 1);
        assert!(!cfg.discovery.is_enabled());
    }
}
