//! Shared data model: chain events, contract instances, bridge messages and ledger entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric chain identifier (EIP-155 style).
pub type ChainId = u64;

/// Block height on a chain.
pub type BlockNumber = u64;

/// Normalise an address to lowercase `0x…` form so dedup is case-insensitive.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// Publish-dedup key: `(chain_id, tx_hash, log_index)` uniquely identifies an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub chain_id: ChainId,
    pub tx_hash: String,
    pub log_index: u32,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.tx_hash, self.log_index)
    }
}

/// A normalized on-chain event emitted by a monitored contract instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Emitting contract (normalized lowercase).
    pub contract_address: String,
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub tx_hash: String,
    /// Log index within the block.
    pub log_index: u32,
    /// Event signature (topic0) or a decoded event name.
    pub event_type: String,
    /// Raw topics/data as JSON.
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// The key downstream consumers deduplicate on.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }

    /// Intra-contract publish order.
    pub fn position(&self) -> (BlockNumber, u32) {
        (self.block_number, self.log_index)
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// A monitored contract instance discovered from a factory deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInstance {
    pub address: String,
    pub chain_id: ChainId,
    pub discovered_at_block: BlockNumber,
}

impl ContractInstance {
    pub fn new(address: &str, chain_id: ChainId, discovered_at_block: BlockNumber) -> Self {
        Self {
            address: normalize_address(address),
            chain_id,
            discovered_at_block,
        }
    }
}

/// Result of a registry insert. Re-registration is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub newly_added: bool,
}

// ─── Outbound bridge messages ─────────────────────────────────────────────────

/// Delivery status of an outbound cross-chain message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
}

impl MessageStatus {
    /// `Confirmed` and `Failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Sent => write!(f, "SENT"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// An outbound cross-chain message tracked through delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    /// Name of the bridge adapter chosen when the message was created.
    pub protocol: String,
    pub recipient: String,
    pub payload: Vec<u8>,
    /// Native fee offered to the bridge.
    pub fee: u128,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
    /// Protocol-level receipt returned by the adapter on the last send.
    pub receipt: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

/// Key of a ledger entry: the chain whose state it mirrors plus the account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub chain_id: ChainId,
    pub key: String,
}

impl LedgerKey {
    pub fn new(chain_id: ChainId, key: impl Into<String>) -> Self {
        Self {
            chain_id,
            key: key.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain_id, self.key)
    }
}

/// One account's position as seen on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLedgerEntry {
    pub chain_id: ChainId,
    pub key: String,
    pub collateral: u128,
    pub borrowed: u128,
    /// Unix timestamp of the last mutation.
    pub updated_at: i64,
}

impl ChainLedgerEntry {
    pub fn empty(ledger_key: &LedgerKey) -> Self {
        Self {
            chain_id: ledger_key.chain_id,
            key: ledger_key.key.clone(),
            collateral: 0,
            borrowed: 0,
            updated_at: 0,
        }
    }

    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(self.chain_id, self.key.clone())
    }

    /// `collateral - borrowed`, the entry's contribution to the credit line.
    pub fn net(&self) -> i128 {
        self.collateral as i128 - self.borrowed as i128
    }
}

/// The two update kinds a source chain can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerUpdate {
    /// Legacy delta update. Double-counts if ever re-applied.
    Increment {
        collateral_delta: i128,
        borrowed_delta: i128,
    },
    /// Absolute assignment of the source chain's current values.
    SyncState { collateral: u128, borrowed: u128 },
}

/// A cross-chain state message delivered by a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub source_chain: ChainId,
    pub account: String,
    pub update: LedgerUpdate,
}

impl InboundMessage {
    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(self.source_chain, self.account.clone())
    }
}

/// Replay guard record for a processed inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub message_id: String,
    pub processed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalization() {
        assert_eq!(normalize_address("0xAbCDef"), "0xabcdef");
        assert_eq!(normalize_address("ABCDEF"), "0xabcdef");
        assert_eq!(normalize_address(" 0XAA "), "0xaa");
    }

    #[test]
    fn dedup_key_display() {
        let ev = RawEvent {
            contract_address: "0xaaa".into(),
            chain_id: 1,
            block_number: 105,
            tx_hash: "0xfeed".into(),
            log_index: 2,
            event_type: "Opened".into(),
            payload: serde_json::Value::Null,
        };
        assert_eq!(ev.dedup_key().to_string(), "1:0xfeed:2");
        assert_eq!(ev.position(), (105, 2));
    }

    #[test]
    fn entry_net_can_be_negative() {
        let mut e = ChainLedgerEntry::empty(&LedgerKey::new(1, "u"));
        e.collateral = 100;
        e.borrowed = 250;
        assert_eq!(e.net(), -150);
    }

    #[test]
    fn update_wire_format() {
        let u = LedgerUpdate::SyncState { collateral: 500, borrowed: 0 };
        let json = serde_json::to_value(&u).unwrap();
        assert_eq!(json["SYNC_STATE"]["collateral"], 500);
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Sent.is_terminal());
    }
}
