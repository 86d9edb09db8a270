//! EVM log source.
//!
//! Wraps a JSON-RPC `eth_getLogs` / `eth_blockNumber` client, splits large
//! ranges, drops reorged logs and normalizes the rest into [`RawEvent`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use chainledger_core::error::LedgerError;
use chainledger_core::source::{ChainLogSource, LogQuery};
use chainledger_core::types::{normalize_address, BlockNumber, ChainId, RawEvent};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(rename = "removed")]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, LedgerError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, LedgerError> {
        let v = parse_hex_u64(&self.log_index)?;
        u32::try_from(v).map_err(|_| LedgerError::Decode(format!("log index {v} out of range")))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Normalize into a [`RawEvent`] for `chain_id`.
    pub fn into_event(self, chain_id: ChainId) -> Result<RawEvent, LedgerError> {
        let block_number = self.block_number_u64()?;
        let log_index = self.log_index_u32()?;
        let event_type = self.topics.first().cloned().unwrap_or_default();
        Ok(RawEvent {
            contract_address: normalize_address(&self.address),
            chain_id,
            block_number,
            tx_hash: self.tx_hash.to_ascii_lowercase(),
            log_index,
            event_type,
            payload: json!({
                "topics": self.topics,
                "data": self.data,
                "block_hash": self.block_hash,
            }),
        })
    }
}

/// JSON-RPC surface an EVM provider must offer.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, LedgerError>;
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
        topics: &[String],
    ) -> Result<Vec<RawLog>, LedgerError>;
}

/// [`ChainLogSource`] over an [`EvmRpcClient`] with range batching.
pub struct EvmLogSource<C> {
    client: C,
    chain_id: ChainId,
    max_range: u64,
}

impl<C: EvmRpcClient> EvmLogSource<C> {
    pub fn new(client: C, chain_id: ChainId, max_range: u64) -> Self {
        Self {
            client,
            chain_id,
            max_range: max_range.max(1),
        }
    }

    /// Fetch all logs in `[from, to]`, splitting into `max_range`-sized chunks.
    async fn logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, LedgerError> {
        let (from, to) = (query.from_block, query.to_block);
        if to < from {
            return Ok(vec![]);
        }
        if to - from < self.max_range {
            return self
                .client
                .get_logs(from, to, &query.addresses, &query.event_signatures)
                .await;
        }
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = (start + self.max_range - 1).min(to);
            let chunk = self
                .client
                .get_logs(start, end, &query.addresses, &query.event_signatures)
                .await?;
            all_logs.extend(chunk);
            start = end + 1;
        }
        Ok(all_logs)
    }
}

#[async_trait]
impl<C: EvmRpcClient> ChainLogSource for EvmLogSource<C> {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn get_block_number(&self) -> Result<BlockNumber, LedgerError> {
        self.client.get_block_number().await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<RawEvent>, LedgerError> {
        let logs = self.logs(query).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.is_removed() {
                tracing::debug!(tx = %log.tx_hash, "Skipping log removed by reorg");
                continue;
            }
            events.push(log.into_event(self.chain_id)?);
        }
        Ok(events)
    }
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, LedgerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| LedgerError::Decode(format!("bad hex quantity '{s}': {e}")))
}
