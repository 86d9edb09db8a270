//! Persistence traits for the ledger applier and the outbound retry state.

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{ChainLedgerEntry, LedgerKey, OutboundMessage, ReplayRecord};

/// Persisted record of inbound messages already applied to the ledger.
///
/// Invariant: a message id is applied at most once. Implementations must make
/// `record` durable before returning.
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError>;

    /// Record a processed message. Returns `false` if it was already recorded.
    async fn record(&self, record: ReplayRecord) -> Result<bool, LedgerError>;

    async fn get(&self, message_id: &str) -> Result<Option<ReplayRecord>, LedgerError>;
}

/// Storage for per-chain ledger entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ChainLedgerEntry>, LedgerError>;

    /// Upsert an entry.
    async fn put(&self, entry: ChainLedgerEntry) -> Result<(), LedgerError>;

    /// Every chain's entry for one account.
    async fn entries_for(&self, account: &str) -> Result<Vec<ChainLedgerEntry>, LedgerError>;
}

/// Outbound messages the retry coordinator has not yet seen confirmed.
///
/// The coordinator writes every state transition here and reloads the set on
/// start. Confirmed messages are removed.
#[async_trait]
pub trait OutboundStore: Send + Sync {
    /// Upsert a message's current state. Must be durable when it returns.
    async fn put_outbound(&self, message: &OutboundMessage) -> Result<(), LedgerError>;

    /// Forget a message. Removing an unknown id is not an error.
    async fn remove_outbound(&self, message_id: &str) -> Result<(), LedgerError>;

    /// Every stored message, ordered by id.
    async fn load_outbound(&self) -> Result<Vec<OutboundMessage>, LedgerError>;
}
