//! The scan loop — one task per chain stream.
//!
//! # One cycle
//! 1. Read the head and compute `[checkpoint + 1, min(checkpoint + batch, head)]`.
//! 2. Query factories for deployments in the range and register new instances.
//! 3. Snapshot the registry and fan out one lifecycle query per instance,
//!    bounded by a semaphore of size `concurrency`, each under `query_timeout`.
//! 4. Publish every returned event (dedup-keyed).
//! 5. Advance the checkpoint only if every query and the publish succeeded
//!    and nobody moved it while the cycle ran.
//!
//! The persisted checkpoint is re-read at the start of each cycle, so an
//! operator `force_set` takes effect on a running loop.
//!
//! A failed query costs latency, never correctness: the same range is scanned
//! again next tick and the dedup key absorbs the events already published.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use chainledger_core::checkpoint::{CheckpointManager, CheckpointStore};
use chainledger_core::config::ScannerConfig;
use chainledger_core::error::LedgerError;
use chainledger_core::publisher::EventSink;
use chainledger_core::registry::ContractRegistry;
use chainledger_core::source::{ChainLogSource, LogQuery};
use chainledger_core::stream::{BlockRange, ChainStream};
use chainledger_core::types::{BlockNumber, DedupKey, RawEvent};

use crate::discovery::instance_address;

/// Runtime state of a scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    /// Behind the head; cycles run back to back.
    CatchingUp,
    /// At the head; cycles run every poll interval.
    Live,
    /// Last cycle did not advance.
    Degraded,
    Stopped,
}

impl std::fmt::Display for ScannerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Live => write!(f, "live"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A query that failed within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFailure {
    /// Instance address, or `"discovery"` for the factory query.
    pub target: String,
    pub range: BlockRange,
    pub error: String,
}

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub range: Option<BlockRange>,
    pub head: BlockNumber,
    pub discovered: usize,
    pub queried: usize,
    pub events_published: usize,
    pub failures: Vec<QueryFailure>,
    pub publish_error: Option<String>,
    pub advanced: bool,
}

/// Scans one chain stream.
pub struct ScanLoop {
    config: ScannerConfig,
    source: Arc<dyn ChainLogSource>,
    registry: Arc<ContractRegistry>,
    checkpoint: CheckpointManager,
    sink: Arc<dyn EventSink>,
    stream: ChainStream,
    limiter: Arc<Semaphore>,
    state: ScannerState,
    resumed: bool,
}

impl ScanLoop {
    /// Build a scan loop, resuming the stream from its persisted checkpoint.
    pub async fn new(
        config: ScannerConfig,
        source: Arc<dyn ChainLogSource>,
        registry: Arc<ContractRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, LedgerError> {
        let checkpoint = CheckpointManager::new(checkpoints, config.chain_id);
        let cursor = checkpoint.load().await?;
        if let Some(block) = cursor {
            info!(chain_id = config.chain_id, block, "Resuming from checkpoint");
        }
        let stream = ChainStream::resume(config.chain_id, config.start_block, cursor);
        Ok(Self {
            limiter: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            source,
            registry,
            checkpoint,
            sink,
            stream,
            state: ScannerState::Idle,
            resumed: true,
        })
    }

    pub fn stream(&self) -> &ChainStream {
        &self.stream
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Run cycles until `shutdown` flips to `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        info!(chain_id = self.config.chain_id, "Scan loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = tokio::select! {
                r = self.run_cycle() => r,
                _ = shutdown.changed() => break,
            };
            let pause = match report {
                Ok(r) if r.advanced && self.stream.lag > 0 => Duration::ZERO,
                Ok(_) => poll,
                Err(e) => {
                    warn!(chain_id = self.config.chain_id, error = %e, "Scan cycle failed");
                    self.state = ScannerState::Degraded;
                    poll
                }
            };
            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        self.state = ScannerState::Stopped;
        info!(chain_id = self.config.chain_id, "Scan loop stopped");
    }

    /// Execute one cycle.
    ///
    /// Errors are returned only when the head cannot be read or the checkpoint
    /// cannot be written; query failures are contained in the report.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, LedgerError> {
        let chain_id = self.config.chain_id;
        let deadline = Instant::now() + Duration::from_millis(self.config.cycle_deadline_ms);

        let head = self
            .bounded("getBlockNumber", self.source.get_block_number())
            .await?;
        let started_from = self.sync_cursor().await?;
        self.stream.observe_head(head);

        let overlap = if self.resumed { self.config.reorg_overlap } else { 0 };
        let Some(range) = self.stream.next_range(head, self.config.batch_size, overlap) else {
            self.state = ScannerState::Live;
            return Ok(CycleReport {
                head,
                ..Default::default()
            });
        };
        let mut report = CycleReport {
            range: Some(range),
            head,
            ..Default::default()
        };

        if self.config.discovery.is_enabled() {
            match self.discover(range).await {
                Ok(n) => report.discovered = n,
                Err(e) => {
                    warn!(chain_id, %range, error = %e, "Discovery query failed, checkpoint held");
                    report.failures.push(QueryFailure {
                        target: "discovery".into(),
                        range,
                        error: e.to_string(),
                    });
                    self.state = ScannerState::Degraded;
                    return Ok(report);
                }
            }
        }

        let (events, failures, queried) = self.fan_out(range, deadline).await;
        report.queried = queried;
        report.failures = failures;

        if !events.is_empty() {
            match self.sink.publish_batch(&self.config.topic, events).await {
                Ok(n) => report.events_published = n,
                Err(e) => {
                    warn!(chain_id, %range, error = %e, "Publish failed, checkpoint held");
                    report.publish_error = Some(e.to_string());
                }
            }
        }

        if report.failures.is_empty() && report.publish_error.is_none() {
            let stored = self.checkpoint.load().await?;
            if stored != started_from {
                warn!(
                    chain_id,
                    %range,
                    ?started_from,
                    ?stored,
                    "Checkpoint moved during cycle, range result discarded"
                );
                return Ok(report);
            }
            self.checkpoint.advance(range.to).await?;
            self.stream.advance(range.to);
            self.stream.observe_head(head);
            self.resumed = false;
            report.advanced = true;
            self.state = if self.stream.lag > 0 {
                ScannerState::CatchingUp
            } else {
                ScannerState::Live
            };
            info!(
                chain_id,
                %range,
                events = report.events_published,
                discovered = report.discovered,
                lag = self.stream.lag,
                "Scan cycle complete"
            );
        } else {
            for f in &report.failures {
                warn!(chain_id, address = %f.target, range = %f.range, error = %f.error, "Instance query failed");
            }
            self.state = ScannerState::Degraded;
        }
        Ok(report)
    }

    /// Adopt the persisted checkpoint if an operator moved it since the last
    /// cycle. A backwards move re-arms the reorg overlap.
    async fn sync_cursor(&mut self) -> Result<Option<BlockNumber>, LedgerError> {
        let stored = self.checkpoint.load().await?;
        if stored != self.stream.cursor {
            warn!(
                chain_id = self.config.chain_id,
                cursor = ?self.stream.cursor,
                checkpoint = ?stored,
                "Checkpoint changed externally, repositioning stream"
            );
            if self.stream.reposition(stored) {
                self.resumed = true;
            }
        }
        Ok(stored)
    }

    /// Query factories over `range` and register every new instance.
    async fn discover(&self, range: BlockRange) -> Result<usize, LedgerError> {
        let discovery = &self.config.discovery;
        let query = LogQuery::new(
            discovery.factories.clone(),
            range,
            vec![discovery.deployment_signature.clone()],
        );
        let deployments = self.bounded("discovery getLogs", self.source.get_logs(&query)).await?;

        let mut added = 0;
        for event in &deployments {
            let Some(address) = instance_address(event, discovery) else {
                warn!(tx = %event.tx_hash, "Deployment event without instance address");
                continue;
            };
            let reg = self
                .registry
                .register(&address, self.config.chain_id, event.block_number)
                .await?;
            if reg.newly_added {
                added += 1;
            }
        }
        Ok(added)
    }

    /// One lifecycle query per registered instance, bounded by the limiter.
    async fn fan_out(
        &self,
        range: BlockRange,
        deadline: Instant,
    ) -> (Vec<RawEvent>, Vec<QueryFailure>, usize) {
        let instances = self.registry.instances(self.config.chain_id).await;
        let query_timeout = Duration::from_millis(self.config.query_timeout_ms);

        let tasks: Vec<_> = instances
            .into_iter()
            .filter(|i| i.discovered_at_block <= range.to)
            .map(|instance| {
                let source = Arc::clone(&self.source);
                let limiter = Arc::clone(&self.limiter);
                let from = range.from.max(instance.discovered_at_block);
                let sub_range = BlockRange { from, to: range.to };
                let query = LogQuery::for_address(
                    instance.address.clone(),
                    sub_range,
                    &self.config.lifecycle_signatures,
                );
                async move {
                    let result = match limiter.acquire_owned().await {
                        Ok(_permit) => match timeout(query_timeout, source.get_logs(&query)).await {
                            Ok(r) => r,
                            Err(_) => Err(LedgerError::Timeout {
                                operation: format!("getLogs {}", instance.address),
                                ms: query_timeout.as_millis() as u64,
                            }),
                        },
                        Err(_) => Err(LedgerError::Other("query limiter closed".into())),
                    };
                    (instance.address, sub_range, result)
                }
            })
            .collect();
        let queried = tasks.len();

        let results = match timeout_at(deadline, join_all(tasks)).await {
            Ok(results) => results,
            Err(_) => {
                return (
                    vec![],
                    vec![QueryFailure {
                        target: "cycle".into(),
                        range,
                        error: "cycle deadline exceeded".into(),
                    }],
                    queried,
                );
            }
        };

        let mut events: BTreeMap<DedupKey, RawEvent> = BTreeMap::new();
        let mut failures = Vec::new();
        for (address, sub_range, result) in results {
            match result {
                Ok(found) => {
                    debug!(%address, range = %sub_range, count = found.len(), "Instance query ok");
                    for ev in found {
                        events.entry(ev.dedup_key()).or_insert(ev);
                    }
                }
                Err(e) => failures.push(QueryFailure {
                    target: address,
                    range: sub_range,
                    error: e.to_string(),
                }),
            }
        }
        (events.into_values().collect(), failures, queried)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, LedgerError> {
        let limit = Duration::from_millis(self.config.query_timeout_ms);
        timeout(limit, fut).await.map_err(|_| LedgerError::Timeout {
            operation: operation.to_string(),
            ms: limit.as_millis() as u64,
        })?
    }
}
