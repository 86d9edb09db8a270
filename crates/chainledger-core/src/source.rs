//! Chain log source — the external interface the scanner queries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::stream::BlockRange;
use crate::types::{BlockNumber, ChainId, RawEvent};

/// A `getLogs` query: addresses × event signatures over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub addresses: Vec<String>,
    pub from_block: BlockNumber,
    pub to_block: BlockNumber,
    /// Topic0 values to match (empty = all events).
    pub event_signatures: Vec<String>,
}

impl LogQuery {
    pub fn new(addresses: Vec<String>, range: BlockRange, event_signatures: Vec<String>) -> Self {
        Self {
            addresses,
            from_block: range.from,
            to_block: range.to,
            event_signatures,
        }
    }

    /// Single-address query.
    pub fn for_address(address: impl Into<String>, range: BlockRange, event_signatures: &[String]) -> Self {
        Self::new(vec![address.into()], range, event_signatures.to_vec())
    }
}

/// A provider of normalized chain events for one chain.
#[async_trait]
pub trait ChainLogSource: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Current chain head.
    async fn get_block_number(&self) -> Result<BlockNumber, LedgerError>;

    /// Events matching the query, normalized to [`RawEvent`].
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawEvent>, LedgerError>;
}
