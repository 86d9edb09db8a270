//! chainledger-scanner — EVM log source, factory discovery and the per-chain scan loop.

pub mod builder;
pub mod discovery;
pub mod fetcher;
pub mod scan_loop;

pub use builder::ScannerBuilder;
pub use discovery::instance_address;
pub use fetcher::{EvmLogSource, EvmRpcClient, RawLog};
pub use scan_loop::{CycleReport, QueryFailure, ScanLoop, ScannerState};
