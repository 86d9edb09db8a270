//! chainledger-bridge — cross-chain message delivery.
//!
//! ```text
//! caller ──prepare──► BridgeRouter ──► RetryCoordinator (track)
//!                          │                 │ poll_due / sweep_timeouts
//!                          ▼                 ▼
//!                   BridgeAdapter ◄──── dispatch / track_delivery
//!          (LayerZero | Hyperlane | CCIP) ──► SubmissionTransport
//! ```

pub mod adapter;
pub mod adapters;
pub mod coordinator;
pub mod retry;
pub mod router;

pub use adapter::{BridgeAdapter, DeliveryStatus, Envelope, MemoryTransport, SubmissionTransport};
pub use adapters::{CcipAdapter, HyperlaneAdapter, LayerZeroAdapter};
pub use coordinator::{RetryCoordinator, RoundReport};
pub use retry::{BackoffPolicy, RetryConfig};
pub use router::BridgeRouter;
