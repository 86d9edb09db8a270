//! Fluent builder for scan loops.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainledger_scanner::ScannerBuilder;
//!
//! let config = ScannerBuilder::new()
//!     .chain_id(137)
//!     .start_block(50_000_000)
//!     .batch_size(500)
//!     .concurrency(16)
//!     .factory("0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f", "0x0d3648bd")
//!     .build_config();
//! ```

use std::sync::Arc;

use chainledger_core::checkpoint::CheckpointStore;
use chainledger_core::config::ScannerConfig;
use chainledger_core::error::LedgerError;
use chainledger_core::publisher::EventSink;
use chainledger_core::registry::ContractRegistry;
use chainledger_core::source::ChainLogSource;
use chainledger_core::types::normalize_address;

use crate::scan_loop::ScanLoop;

/// Fluent builder for [`ScannerConfig`] and [`ScanLoop`].
#[derive(Default)]
pub struct ScannerBuilder {
    config: ScannerConfig,
}

impl ScannerBuilder {
    pub fn new() -> Self {
        Self {
            config: ScannerConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from a node config file).
    pub fn from_config(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    /// First block scanned when no checkpoint exists.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Maximum concurrent per-instance queries.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.config.query_timeout_ms = ms;
        self
    }

    pub fn cycle_deadline_ms(mut self, ms: u64) -> Self {
        self.config.cycle_deadline_ms = ms;
        self
    }

    /// Blocks re-scanned below the checkpoint on the first cycle after start.
    pub fn reorg_overlap(mut self, blocks: u64) -> Self {
        self.config.reorg_overlap = blocks;
        self
    }

    /// Add a factory contract and the signature of its deployment event.
    pub fn factory(mut self, address: &str, deployment_signature: impl Into<String>) -> Self {
        self.config.discovery.factories.push(normalize_address(address));
        self.config.discovery.deployment_signature = deployment_signature.into();
        self
    }

    /// Add a lifecycle event signature queried on every instance.
    pub fn lifecycle_event(mut self, signature: impl Into<String>) -> Self {
        self.config.lifecycle_signatures.push(signature.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn build_config(self) -> ScannerConfig {
        self.config
    }

    /// Build a [`ScanLoop`] resumed from `checkpoints`.
    pub async fn build(
        self,
        source: Arc<dyn ChainLogSource>,
        registry: Arc<ContractRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ScanLoop, LedgerError> {
        if source.chain_id() != self.config.chain_id {
            return Err(LedgerError::Other(format!(
                "source serves chain {} but scanner is configured for chain {}",
                source.chain_id(),
                self.config.chain_id
            )));
        }
        ScanLoop::new(self.config, source, registry, checkpoints, sink).await
    }
}
