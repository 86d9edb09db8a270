//! LayerZero V2 adapter.
//!
//! Destinations are addressed by endpoint id (EID), not chain id.
//! <https://docs.layerzero.network/v2/deployments/deployed-contracts>

use std::sync::Arc;

use async_trait::async_trait;

use chainledger_core::error::LedgerError;
use chainledger_core::types::ChainId;

use crate::adapter::{
    decode_recipient, ensure_fee, word, BridgeAdapter, DeliveryStatus, Envelope, SubmissionTransport,
};

pub const PROTOCOL: &str = "layerzero";

/// Packet framing version.
const PACKET_VERSION: u8 = 1;
/// Flat DVN + executor fee, in wei.
const BASE_FEE: u128 = 40_000_000_000_000;
const FEE_PER_BYTE: u128 = 1_500_000_000;

/// Map an EVM chain id to its LayerZero V2 endpoint id.
pub fn endpoint_id(chain_id: ChainId) -> Option<u32> {
    match chain_id {
        1 => Some(30101),
        56 => Some(30102),
        43114 => Some(30106),
        137 => Some(30109),
        42161 => Some(30110),
        10 => Some(30111),
        8453 => Some(30184),
        11155111 => Some(40161),
        _ => None,
    }
}

pub struct LayerZeroAdapter {
    transport: Arc<dyn SubmissionTransport>,
}

impl LayerZeroAdapter {
    pub fn new(transport: Arc<dyn SubmissionTransport>) -> Self {
        Self { transport }
    }

    /// `version(1) | dst_eid(4, BE) | receiver(32) | payload`.
    pub fn frame(dst_eid: u32, receiver: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + 32 + payload.len());
        out.push(PACKET_VERSION);
        out.extend_from_slice(&dst_eid.to_be_bytes());
        out.extend_from_slice(&word(receiver));
        out.extend_from_slice(payload);
        out
    }

    fn eid(&self, dest_chain: ChainId) -> Result<u32, LedgerError> {
        endpoint_id(dest_chain).ok_or(LedgerError::UnsupportedChain(dest_chain))
    }
}

#[async_trait]
impl BridgeAdapter for LayerZeroAdapter {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn is_chain_supported(&self, chain_id: ChainId) -> bool {
        endpoint_id(chain_id).is_some()
    }

    fn estimate_gas(&self, dest_chain: ChainId, payload: &[u8]) -> Result<u128, LedgerError> {
        self.eid(dest_chain)?;
        Ok(BASE_FEE + FEE_PER_BYTE * payload.len() as u128)
    }

    async fn send_message(
        &self,
        dest_chain: ChainId,
        recipient: &str,
        payload: &[u8],
        fee: u128,
    ) -> Result<String, LedgerError> {
        let eid = self.eid(dest_chain)?;
        ensure_fee(PROTOCOL, fee, self.estimate_gas(dest_chain, payload)?)?;
        let receiver = decode_recipient(PROTOCOL, recipient)?;
        self.transport
            .submit(Envelope {
                protocol: PROTOCOL.to_string(),
                dest_chain,
                dest_id: eid as u64,
                recipient: recipient.to_string(),
                body: Self::frame(eid, &receiver, payload),
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
    use crate::adapter::MemoryTransport;

    #[test]
    fn eid_table() {
        assert_eq!(endpoint_id(1), Some(30101));
        assert_eq!(endpoint_id(42161), Some(30110));
        assert_eq!(endpoint_id(999_999), None);
    }

    #[test]
    fn frame_layout() {
        let body = LayerZeroAdapter::frame(30111, &[0xaa; 20], b"hi");
        assert_eq!(body[0], PACKET_VERSION);
        assert_eq!(&body[1..5], &30111u32.to_be_bytes());
        assert_eq!(&body[5 + 12..37], &[0xaa; 20]);
        assert_eq!(&body[37..], b"hi");
    }

    #[tokio::test]
    async fn send_checks_fee_and_submits() {
        let transport = Arc::new(MemoryTransport::new());
        let lz = LayerZeroAdapter::new(transport.clone());
        let fee = lz.estimate_gas(10, b"payload").unwrap();

        assert!(lz.send_message(10, "0x01", b"payload", fee - 1).await.is_err());
        lz.send_message(10, "0x01", b"payload", fee).await.unwrap();

        let sent = transport.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest_id, 30111);
    }

    #[tokio::test]
    async fn unsupported_destination() {
        let lz = LayerZeroAdapter::new(Arc::new(MemoryTransport::new()));
        let err = lz.send_message(999_999, "0x01", b"x", u128::MAX).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnsupportedChain(999_999)));
    }
}
