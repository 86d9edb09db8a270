//! Message bus publisher.
//!
//! Downstream delivery is at-least-once; every event carries its
//! `(chain_id, tx_hash, log_index)` dedup key so consumers see it once.
//!
//! ```text
//! ScanLoop ──► EventSink ──► PublisherHandle ──mpsc──► PublisherService ──► EventPublisher ──► MessageBus
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::PublisherConfig;
use crate::error::LedgerError;
use crate::types::{DedupKey, RawEvent};

/// The downstream message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one event. Returning `Ok` means the bus has durably accepted it.
    async fn publish(&self, topic: &str, event: &RawEvent, dedup_key: &DedupKey) -> Result<(), LedgerError>;
}

/// Anything the scanner can hand a finished batch to.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish every event; returns once all are durably accepted.
    async fn publish_batch(&self, topic: &str, events: Vec<RawEvent>) -> Result<usize, LedgerError>;
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub transient_retries: u64,
    pub failed_batches: u64,
}

/// Publishes batches to a [`MessageBus`], retrying transient failures.
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
    config: PublisherConfig,
    published: AtomicU64,
    transient_retries: AtomicU64,
    failed_batches: AtomicU64,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, config: PublisherConfig) -> Self {
        Self {
            bus,
            config,
            published: AtomicU64::new(0),
            transient_retries: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Order a batch so each contract's events are ascending by `(block, log_index)`.
    pub fn order_batch(mut events: Vec<RawEvent>) -> Vec<RawEvent> {
        events.sort_by(|a, b| {
            a.contract_address
                .cmp(&b.contract_address)
                .then(a.position().cmp(&b.position()))
        });
        events
    }

    async fn publish_one(&self, topic: &str, event: &RawEvent) -> Result<(), LedgerError> {
        let key = event.dedup_key();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.bus.publish(topic, event, &key).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(%key, attempt, ?delay, error = %e, "Transient publish failure, retrying");
                    self.transient_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(20));
        Duration::from_millis(base.min(self.config.max_backoff_ms))
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish_batch(&self, topic: &str, events: Vec<RawEvent>) -> Result<usize, LedgerError> {
        let events = Self::order_batch(events);
        for event in &events {
            if let Err(e) = self.publish_one(topic, event).await {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            debug!(key = %event.dedup_key(), "Published event");
        }
        self.published.fetch_add(events.len() as u64, Ordering::Relaxed);
        Ok(events.len())
    }
}

// ─── Publisher task ───────────────────────────────────────────────────────────

struct PublishJob {
    topic: String,
    events: Vec<RawEvent>,
    ack: oneshot::Sender<Result<usize, LedgerError>>,
}

/// Handle to a running [`PublisherService`]. Cheap to clone.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<PublishJob>,
}

#[async_trait]
impl EventSink for PublisherHandle {
    async fn publish_batch(&self, topic: &str, events: Vec<RawEvent>) -> Result<usize, LedgerError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(PublishJob {
                topic: topic.to_string(),
                events,
                ack,
            })
            .await
            .map_err(|_| LedgerError::TransientIo("publisher task stopped".into()))?;
        done.await
            .map_err(|_| LedgerError::TransientIo("publisher dropped the batch".into()))?
    }
}

/// Publisher running as its own task; batches are acknowledged once published.
pub struct PublisherService {
    publisher: Arc<EventPublisher>,
    rx: mpsc::Receiver<PublishJob>,
}

impl PublisherService {
    pub fn new(publisher: Arc<EventPublisher>, queue_capacity: usize) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        (Self { publisher, rx }, PublisherHandle { tx })
    }

    /// Spawn onto the current runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain jobs until every handle is dropped.
    pub async fn run(mut self) {
        info!("Publisher task started");
        while let Some(job) = self.rx.recv().await {
            let result = self.publisher.publish_batch(&job.topic, job.events).await;
            if let Err(e) = &result {
                warn!(topic = %job.topic, error = %e, "Batch publish failed");
            }
            // Receiver gone means the scan cycle was cancelled; nothing to do.
            let _ = job.ack.send(result);
        }
        info!("Publisher task stopped");
    }
}

// ─── In-memory bus ────────────────────────────────────────────────────────────

/// In-process bus with an idempotent downstream: one record per dedup key.
pub struct MemoryBus {
    records: Mutex<BTreeMap<DedupKey, RawEvent>>,
    topics: Mutex<HashMap<DedupKey, String>>,
    deliveries: AtomicU64,
    fail_next: AtomicU32,
    tx: broadcast::Sender<RawEvent>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            records: Mutex::new(BTreeMap::new()),
            topics: Mutex::new(HashMap::new()),
            deliveries: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
            tx,
        }
    }

    /// Subscribe to newly recorded (non-duplicate) events.
    pub fn subscribe(&self) -> broadcast::Receiver<RawEvent> {
        self.tx.subscribe()
    }

    /// Make the next `n` publishes fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Distinct downstream records.
    pub fn records(&self) -> Vec<RawEvent> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Raw publish calls accepted, duplicates included.
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::SeqCst)
    }

    pub fn topic_of(&self, key: &DedupKey) -> Option<String> {
        self.topics.lock().unwrap().get(key).cloned()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, event: &RawEvent, dedup_key: &DedupKey) -> Result<(), LedgerError> {
        let pending_failures = self.fail_next.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next.store(pending_failures - 1, Ordering::SeqCst);
            return Err(LedgerError::TransientIo("bus unavailable".into()));
        }
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        if records.contains_key(dedup_key) {
            debug!(key = %dedup_key, "Duplicate suppressed by dedup key");
            return Ok(());
        }
        records.insert(dedup_key.clone(), event.clone());
        self.topics
            .lock()
            .unwrap()
            .insert(dedup_key.clone(), topic.to_string());
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(addr: &str, block: u64, log_index: u32) -> RawEvent {
        RawEvent {
            contract_address: addr.into(),
            chain_id: 1,
            block_number: block,
            tx_hash: format!("0x{block:x}{log_index:x}"),
            log_index,
            event_type: "Lifecycle".into(),
            payload: serde_json::Value::Null,
        }
    }

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            queue_capacity: 4,
        }
    }

    #[test]
    fn batch_order_is_per_contract_ascending() {
        let ordered = EventPublisher::order_batch(vec![
            ev("0xb", 7, 0),
            ev("0xa", 9, 1),
            ev("0xa", 9, 0),
            ev("0xa", 3, 5),
        ]);
        let a: Vec<_> = ordered
            .iter()
            .filter(|e| e.contract_address == "0xa")
            .map(|e| e.position())
            .collect();
        assert_eq!(a, vec![(3, 5), (9, 0), (9, 1)]);
    }

    #[tokio::test]
    async fn duplicates_produce_one_record() {
        let bus = Arc::new(MemoryBus::new());
        let publisher = EventPublisher::new(bus.clone(), fast_config());

        publisher.publish_batch("t", vec![ev("0xa", 1, 0)]).await.unwrap();
        publisher.publish_batch("t", vec![ev("0xa", 1, 0)]).await.unwrap();

        assert_eq!(bus.deliveries(), 2);
        assert_eq!(bus.record_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_next(2);
        let publisher = EventPublisher::new(bus.clone(), fast_config());

        assert_eq!(publisher.publish_batch("t", vec![ev("0xa", 1, 0)]).await.unwrap(), 1);
        assert_eq!(publisher.stats().transient_retries, 2);
        assert_eq!(bus.record_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_batch() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_next(3);
        let publisher = EventPublisher::new(bus.clone(), fast_config());

        let err = publisher
            .publish_batch("t", vec![ev("0xa", 1, 0)])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(publisher.stats().failed_batches, 1);
        assert_eq!(bus.record_count(), 0);
    }

    #[tokio::test]
    async fn service_acknowledges_batches() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe();
        let publisher = Arc::new(EventPublisher::new(bus.clone(), fast_config()));
        let (service, handle) = PublisherService::new(publisher, 4);
        let task = service.spawn();

        let n = handle
            .publish_batch("chain-events", vec![ev("0xa", 1, 0), ev("0xa", 2, 0)])
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(sub.recv().await.unwrap().block_number, 1);
        assert_eq!(bus.topic_of(&ev("0xa", 2, 0).dedup_key()).as_deref(), Some("chain-events"));

        drop(handle);
        task.await.unwrap();
    }
}
