//! chainledger-core — foundation for the cross-chain ledger and event pipeline.
//!
//! # Architecture
//!
//! ```text
//! ScanLoop (per chain)
//!     ├── ChainStream        (explicit scan position + lag)
//!     ├── CheckpointManager  (durable, monotonic cursor)
//!     ├── ContractRegistry   (append-only factory-discovered instances)
//!     ├── ChainLogSource     (getLogs / getBlockNumber)
//!     └── EventSink          (dedup-keyed publish to the MessageBus)
//!
//! BridgeRouter → RetryCoordinator     (chainledger-bridge)
//! LedgerApplier → ReplayGuard/LedgerStore (chainledger-ledger)
//! AdminService                         (force-set checkpoints, status)
//! ```

pub mod admin;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod publisher;
pub mod registry;
pub mod source;
pub mod state;
pub mod stream;
pub mod types;

pub use admin::{AdminService, ForceCheckpointRequest, ForceCheckpointResponse, StreamStatus};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore};
pub use config::{AdminConfig, DiscoveryConfig, PublisherConfig, ScannerConfig};
pub use error::LedgerError;
pub use publisher::{
    EventPublisher, EventSink, MemoryBus, MessageBus, PublisherHandle, PublisherService, PublisherStats,
};
pub use registry::{ContractRegistry, RegistryStore};
pub use source::{ChainLogSource, LogQuery};
pub use state::{LedgerStore, OutboundStore, ReplayGuard};
pub use stream::{BlockRange, ChainStream};
pub use types::{
    BlockNumber, ChainId, ChainLedgerEntry, ContractInstance, DedupKey, InboundMessage, LedgerKey,
    LedgerUpdate, MessageStatus, OutboundMessage, RawEvent, Registration, ReplayRecord,
};
