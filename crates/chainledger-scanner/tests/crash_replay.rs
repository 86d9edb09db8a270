//! Crash/restart behaviour of the scan loop over durable file storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use chainledger_core::checkpoint::CheckpointStore;
use chainledger_core::config::{PublisherConfig, ScannerConfig};
use chainledger_core::error::LedgerError;
use chainledger_core::publisher::{EventPublisher, EventSink, MemoryBus, PublisherService};
use chainledger_core::registry::ContractRegistry;
use chainledger_core::source::{ChainLogSource, LogQuery};
use chainledger_core::types::{BlockNumber, ChainId, RawEvent};
use chainledger_scanner::ScannerBuilder;
use chainledger_storage::FileStorage;

const TX_X: &str = "0x5e1ec7ed";

/// One lifecycle event on 0xaaa at block 105, logIndex 2.
struct OneEventSource;

#[async_trait]
impl ChainLogSource for OneEventSource {
    fn chain_id(&self) -> ChainId {
        1
    }

    async fn get_block_number(&self) -> Result<BlockNumber, LedgerError> {
        Ok(110)
    }

    async fn get_logs(&self, q: &LogQuery) -> Result<Vec<RawEvent>, LedgerError> {
        if !q.addresses.iter().any(|a| a == "0xaaa") || q.from_block > 105 || q.to_block < 105 {
            return Ok(vec![]);
        }
        Ok(vec![RawEvent {
            contract_address: "0xaaa".into(),
            chain_id: 1,
            block_number: 105,
            tx_hash: TX_X.into(),
            log_index: 2,
            event_type: "Opened".into(),
            payload: json!({ "data": "0x" }),
        }])
    }
}

/// Publishes, then "crashes" before the scan loop can advance its checkpoint.
struct CrashAfterPublish {
    inner: Arc<dyn EventSink>,
    crashed: AtomicBool,
}

#[async_trait]
impl EventSink for CrashAfterPublish {
    async fn publish_batch(&self, topic: &str, events: Vec<RawEvent>) -> Result<usize, LedgerError> {
        let n = self.inner.publish_batch(topic, events).await?;
        if !self.crashed.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::TransientIo("process killed".into()));
        }
        Ok(n)
    }
}

fn config() -> ScannerConfig {
    ScannerBuilder::new()
        .chain_id(1)
        .start_block(100)
        .batch_size(11)
        .build_config()
}

#[tokio::test]
async fn restart_before_checkpoint_republishes_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let publisher = Arc::new(EventPublisher::new(bus.clone(), PublisherConfig::default()));

    // First run: event published, checkpoint never written.
    {
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let registry = Arc::new(ContractRegistry::load(storage.clone()).await.unwrap());
        registry.register("0xAAA", 1, 100).await.unwrap();

        let sink = Arc::new(CrashAfterPublish {
            inner: publisher.clone(),
            crashed: AtomicBool::new(false),
        });
        let mut scan = ScannerBuilder::from_config(config())
            .build(Arc::new(OneEventSource), registry, storage.clone(), sink)
            .await
            .unwrap();

        let report = scan.run_cycle().await.unwrap();
        assert!(!report.advanced);
        assert!(storage.load(1).await.unwrap().is_none());
    }
    assert_eq!(bus.record_count(), 1);

    // Restart from disk: same range, same dedup key, still one record.
    let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
    let registry = Arc::new(ContractRegistry::load(storage.clone()).await.unwrap());
    assert!(registry.contains(1, "0xaaa").await);

    let (service, handle) = PublisherService::new(publisher.clone(), 8);
    let task = service.spawn();
    let mut scan = ScannerBuilder::from_config(config())
        .build(Arc::new(OneEventSource), registry, storage.clone(), Arc::new(handle))
        .await
        .unwrap();

    let report = scan.run_cycle().await.unwrap();
    assert_eq!(report.range.map(|r| (r.from, r.to)), Some((100, 110)));
    assert!(report.advanced);

    assert_eq!(bus.deliveries(), 2, "event was delivered twice");
    assert_eq!(bus.record_count(), 1, "downstream kept one record");
    let record = &bus.records()[0];
    assert_eq!(record.dedup_key().to_string(), format!("1:{TX_X}:2"));
    assert_eq!(storage.load(1).await.unwrap().unwrap().block_number, 110);

    drop(scan);
    task.await.unwrap();
}

#[tokio::test]
async fn checkpoint_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let bus = Arc::new(MemoryBus::new());
    let publisher = Arc::new(EventPublisher::new(bus.clone(), PublisherConfig::default()));

    {
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let registry = Arc::new(ContractRegistry::load(storage.clone()).await.unwrap());
        registry.register("0xaaa", 1, 100).await.unwrap();
        let mut scan = ScannerBuilder::from_config(config())
            .build(Arc::new(OneEventSource), registry, storage, publisher.clone())
            .await
            .unwrap();
        assert!(scan.run_cycle().await.unwrap().advanced);
    }

    let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
    let registry = Arc::new(ContractRegistry::load(storage.clone()).await.unwrap());
    let mut scan = ScannerBuilder::from_config(config())
        .build(Arc::new(OneEventSource), registry, storage, publisher)
        .await
        .unwrap();
    assert_eq!(scan.stream().cursor, Some(110));

    let report = scan.run_cycle().await.unwrap();
    assert!(report.range.is_none(), "already at head");
    assert_eq!(bus.deliveries(), 1);
}

#[tokio::test]
async fn builder_rejects_mismatched_source() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
    let registry = Arc::new(ContractRegistry::load(storage.clone()).await.unwrap());
    let bus = Arc::new(MemoryBus::new());
    let sink = Arc::new(EventPublisher::new(bus, PublisherConfig::default()));

    let result = ScannerBuilder::new()
        .chain_id(137)
        .build(Arc::new(OneEventSource), registry, storage, sink)
        .await;
    assert!(result.is_err());
}
