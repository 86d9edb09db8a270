//! The `BridgeAdapter` trait — one implementation per cross-chain messaging network.
//!
//! Adapters own their protocol's framing: they turn `(dest, recipient, payload)`
//! into an [`Envelope`] addressed to the protocol's on-chain entry point and
//! hand it to a [`SubmissionTransport`]. The router never looks inside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chainledger_core::error::LedgerError;
use chainledger_core::types::ChainId;

/// Delivery state reported by a bridge for a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Accepted by the bridge, not yet executed on the destination.
    Pending,
    Delivered,
    Failed(String),
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A protocol-framed message ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    pub dest_chain: ChainId,
    /// Protocol-specific destination id (endpoint id, domain, chain selector).
    pub dest_id: u64,
    pub recipient: String,
    /// Framed bytes as the protocol's entry point expects them.
    pub body: Vec<u8>,
    pub fee: u128,
}

/// Submits framed envelopes to a bridge's source-chain entry point.
///
/// Implementations sign and broadcast the transaction; tests use
/// [`MemoryTransport`].
#[async_trait]
pub trait SubmissionTransport: Send + Sync {
    /// Submit an envelope; returns the protocol receipt (message id / tx hash).
    async fn submit(&self, envelope: Envelope) -> Result<String, LedgerError>;

    /// Query delivery status for a receipt.
    async fn delivery_status(&self, receipt: &str) -> Result<DeliveryStatus, LedgerError>;
}

/// A cross-chain messaging protocol.
///
/// # Object Safety
/// Stored as `Arc<dyn BridgeAdapter>` in the router.
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    /// Protocol name, e.g. `"layerzero"`. Unique within a router.
    fn protocol(&self) -> &str;

    fn is_chain_supported(&self, chain_id: ChainId) -> bool;

    /// Native fee estimate for delivering `payload` to `dest_chain`.
    fn estimate_gas(&self, dest_chain: ChainId, payload: &[u8]) -> Result<u128, LedgerError>;

    /// Frame and submit a message. Returns the protocol receipt.
    async fn send_message(
        &self,
        dest_chain: ChainId,
        recipient: &str,
        payload: &[u8],
        fee: u128,
    ) -> Result<String, LedgerError>;

    /// Ask the bridge whether a sent message has been delivered.
    async fn confirm(&self, receipt: &str) -> Result<DeliveryStatus, LedgerError>;
}

/// Shared fee check used by the concrete adapters.
pub(crate) fn ensure_fee(protocol: &str, offered: u128, required: u128) -> Result<(), LedgerError> {
    if offered < required {
        return Err(LedgerError::Adapter {
            protocol: protocol.to_string(),
            reason: format!("fee {offered} below estimate {required}"),
        });
    }
    Ok(())
}

pub(crate) fn decode_recipient(protocol: &str, recipient: &str) -> Result<Vec<u8>, LedgerError> {
    let digits = recipient.strip_prefix("0x").unwrap_or(recipient);
    let bytes = hex::decode(digits).map_err(|e| LedgerError::Adapter {
        protocol: protocol.to_string(),
        reason: format!("bad recipient '{recipient}': {e}"),
    })?;
    if bytes.len() > 32 {
        return Err(LedgerError::Adapter {
            protocol: protocol.to_string(),
            reason: format!("recipient '{recipient}' longer than 32 bytes"),
        });
    }
    Ok(bytes)
}

/// Left-pad to a 32-byte word.
pub(crate) fn word(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let n = bytes.len().min(32);
    out[32 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    out
}

// ─── In-memory transport ──────────────────────────────────────────────────────

/// In-process transport: records envelopes and lets tests script delivery.
#[derive(Default)]
pub struct MemoryTransport {
    submitted: Mutex<Vec<Envelope>>,
    statuses: Mutex<HashMap<String, DeliveryStatus>>,
    fail_next: Mutex<Option<LedgerError>>,
    seq: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every envelope accepted so far.
    pub fn submitted(&self) -> Vec<Envelope> {
        self.submitted.lock().unwrap().clone()
    }

    /// Make the next `submit` fail with `error`.
    pub fn fail_next(&self, error: LedgerError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// Script the delivery status for a receipt.
    pub fn set_status(&self, receipt: &str, status: DeliveryStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(receipt.to_string(), status);
    }
}

#[async_trait]
impl SubmissionTransport for MemoryTransport {
    async fn submit(&self, envelope: Envelope) -> Result<String, LedgerError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let receipt = format!("0x{}{:08x}", hex::encode(&envelope.protocol), n);
        self.statuses
            .lock()
            .unwrap()
            .insert(receipt.clone(), DeliveryStatus::Pending);
        self.submitted.lock().unwrap().push(envelope);
        Ok(receipt)
    }

    async fn delivery_status(&self, receipt: &str) -> Result<DeliveryStatus, LedgerError> {
        self.statuses
            .lock()
            .unwrap()
            .get(receipt)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownMessage(receipt.to_string()))
    }
}
