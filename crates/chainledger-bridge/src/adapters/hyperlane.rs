//! Hyperlane adapter.
//!
//! Messages are dispatched through the origin chain's Mailbox; domains match
//! EVM chain ids on the networks supported here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use chainledger_core::error::LedgerError;
use chainledger_core::types::ChainId;

use crate::adapter::{
    decode_recipient, ensure_fee, word, BridgeAdapter, DeliveryStatus, Envelope, SubmissionTransport,
};

pub const PROTOCOL: &str = "hyperlane";

const MESSAGE_VERSION: u8 = 3;
/// Interchain gas paymaster quote: destination gas × a flat gas price.
const HANDLE_GAS: u128 = 50_000;
const GAS_PER_BYTE: u128 = 16;
const GAS_PRICE: u128 = 1_000_000_000;

/// Hyperlane domain for a chain id.
pub fn domain_id(chain_id: ChainId) -> Option<u32> {
    match chain_id {
        1 | 10 | 56 | 100 | 137 | 8453 | 42161 | 43114 => Some(chain_id as u32),
        _ => None,
    }
}

pub struct HyperlaneAdapter {
    transport: Arc<dyn SubmissionTransport>,
    origin_domain: u32,
    sender: [u8; 32],
    nonce: AtomicU32,
}

impl HyperlaneAdapter {
    /// `origin_chain` is where this node dispatches from; `sender` the local
    /// application contract.
    pub fn new(
        transport: Arc<dyn SubmissionTransport>,
        origin_chain: ChainId,
        sender: &str,
    ) -> Result<Self, LedgerError> {
        let origin_domain =
            domain_id(origin_chain).ok_or(LedgerError::UnsupportedChain(origin_chain))?;
        Ok(Self {
            transport,
            origin_domain,
            sender: word(&decode_recipient(PROTOCOL, sender)?),
            nonce: AtomicU32::new(0),
        })
    }

    /// `version | nonce | origin | sender | destination | recipient | body`.
    pub fn frame(
        nonce: u32,
        origin: u32,
        sender: &[u8; 32],
        destination: u32,
        recipient: &[u8],
        body: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(77 + body.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&origin.to_be_bytes());
        out.extend_from_slice(sender);
        out.extend_from_slice(&destination.to_be_bytes());
        out.extend_from_slice(&word(recipient));
        out.extend_from_slice(body);
        out
    }
}

#[async_trait]
impl BridgeAdapter for HyperlaneAdapter {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn is_chain_supported(&self, chain_id: ChainId) -> bool {
        domain_id(chain_id).is_some_and(|d| d != self.origin_domain)
    }

    fn estimate_gas(&self, dest_chain: ChainId, payload: &[u8]) -> Result<u128, LedgerError> {
        if !self.is_chain_supported(dest_chain) {
            return Err(LedgerError::UnsupportedChain(dest_chain));
        }
        Ok((HANDLE_GAS + GAS_PER_BYTE * payload.len() as u128) * GAS_PRICE)
    }

    async fn send_message(
        &self,
        dest_chain: ChainId,
        recipient: &str,
        payload: &[u8],
        fee: u128,
    ) -> Result<String, LedgerError> {
        ensure_fee(PROTOCOL, fee, self.estimate_gas(dest_chain, payload)?)?;
        let destination = domain_id(dest_chain).ok_or(LedgerError::UnsupportedChain(dest_chain))?;
        let recipient_bytes = decode_recipient(PROTOCOL, recipient)?;
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        self.transport
            .submit(Envelope {
                protocol: PROTOCOL.to_string(),
                dest_chain,
                dest_id: destination as u64,
                recipient: recipient.to_string(),
                body: Self::frame(
                    nonce,
                    self.origin_domain,
                    &self.sender,
                    destination,
                    &recipient_bytes,
                    payload,
                ),
                fee,
            })
            .await
    }

    async fn confirm(&self, receipt: &str) -> Result<DeliveryStatus, LedgerError> {
        self.transport.delivery_status(receipt).await
    }
}
