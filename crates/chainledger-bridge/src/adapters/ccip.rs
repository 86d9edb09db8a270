//! Chainlink CCIP adapter.
//!
//! Destinations are addressed by 64-bit chain selectors.
//! <https://docs.chain.link/ccip/directory/mainnet>

use std::sync::Arc;

use async_trait::async_trait;

use chainledger_core::error::LedgerError;
use chainledger_core::types::ChainId;

use crate::adapter::{
    decode_recipient, ensure_fee, word, BridgeAdapter, DeliveryStatus, Envelope, SubmissionTransport,
};

pub const PROTOCOL: &str = "ccip";

const BASE_FEE: u128 = 100_000_000_000_000;
const FEE_PER_BYTE: u128 = 2_000_000_000;
/// Destination execution gas limit written into the extra-args word.
const DEFAULT_GAS_LIMIT: u64 = 200_000;

pub fn chain_selector(chain_id: ChainId) -> Option<u64> {
    match chain_id {
        1 => Some(5_009_297_550_715_157_269),
        10 => Some(3_734_403_246_176_062_136),
        56 => Some(11_344_663_589_394_136_015),
        137 => Some(4_051_577_828_743_386_545),
        8453 => Some(15_971_525_489_660_198_786),
        42161 => Some(4_949_039_107_694_359_620),
        43114 => Some(6_433_500_567_565_415_381),
        11155111 => Some(16_015_286_601_757_825_753),
        _ => None,
    }
}

pub struct CcipAdapter {
    transport: Arc<dyn SubmissionTransport>,
    gas_limit: u64,
}

impl CcipAdapter {
    pub fn new(transport: Arc<dyn SubmissionTransport>) -> Self {
        Self {
            transport,
            gas_limit: DEFAULT_GAS_LIMIT,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    /// `selector(8) | receiver(32) | gas_limit(32) | len(32) | data`.
    pub fn frame(selector: u64, receiver: &[u8], gas_limit: u64, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 96 + data.len());
        out.extend_from_slice(&selector.to_be_bytes());
        out.extend_from_slice(&word(receiver));
        out.extend_from_slice(&word(&gas_limit.to_be_bytes()));
        out.extend_from_slice(&word(&(data.len() as u64).to_be_bytes()));
        out.extend_from_slice(data);
        out
    }
}

#[async_trait]
impl BridgeAdapter for CcipAdapter {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn is_chain_supported(&self, chain_id: ChainId) -> bool {
        chain_selector(chain_id).is_some()
    }

    fn estimate_gas(&self, dest_chain: ChainId, payload: &[u8]) -> Result<u128, LedgerError> {
        chain_selector(dest_chain).ok_or(LedgerError::UnsupportedChain(dest_chain))?;
        Ok(BASE_FEE + FEE_PER_BYTE * payload.len() as u128)
    }

    async fn send_message(
        &self,
        dest_chain: ChainId,
        recipient: &str,
        payload: &[u8],
        fee: u128,
    ) -> Result<String, LedgerError> {
        let selector = chain_selector(dest_chain).ok_or(LedgerError::UnsupportedChain(dest_chain))?;
        ensure_fee(PROTOCOL, fee, self.estimate_gas(dest_chain, payload)?)?;
        let receiver = decode_recipient(PROTOCOL, recipient)?;
        self.transport
            .submit(Envelope {
                protocol: PROTOCOL.to_string(),
                dest_chain,
                dest_id: selector,
                recipient: recipient.to_string(),
                body: Self::frame(selector, &receiver, self.gas_limit, payload),
                fee,
            })
            .await
    }

    async fn confirm(&self, receipt: &str) -> Result<DeliveryStatus, LedgerError> {
        self.transport.delivery_status(receipt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_table() {
        assert_eq!(chain_selector(1), Some(5_009_297_550_715_157_269));
        assert!(chain_selector(31337).is_none());
    }

    #[test]
    fn frame_carries_length_prefix() {
        let body = CcipAdapter::frame(7, &[0x11; 20], 300_000, b"data");
        assert_eq!(&body[..8], &7u64.to_be_bytes());
        assert_eq!(&body[8 + 32 + 24..8 + 64], &300_000u64.to_be_bytes());
        assert_eq!(&body[8 + 64 + 24..8 + 96], &4u64.to_be_bytes());
        assert_eq!(&body[104..], b"data");
    }
}
