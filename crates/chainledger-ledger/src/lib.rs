//! # chainledger-ledger
//!
//! Replay-protected application of cross-chain ledger updates.
//!
//! ```text
//!  bridge delivery ──► decode_inbound ──► LedgerApplier::apply
//!                                            │  message-id + per-key lock
//!                                            │  ReplayGuard check
//!                                            ▼
//!                                        LedgerStore (chain, account)
//!                                            ▲
//!  local deposit/borrow/... ─────────────────┘──► StateBroadcast (SYNC_STATE)
//! ```

pub mod applier;
pub mod credit;
mod locks;

pub use applier::{ApplierConfig, ApplyOutcome, LedgerApplier};
pub use credit::{decode_inbound, StateBroadcast};
