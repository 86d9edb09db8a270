//! Bridge protocol router — picks an adapter per destination chain.
//!
//! Selection rule:
//! 1. the preferred adapter for the destination, if set and it supports it;
//! 2. otherwise the first registered adapter (registration order) supporting it;
//! 3. otherwise `UnsupportedChain`.
//!
//! The router performs no retries. Send failures surface to the caller; the
//! [`RetryCoordinator`](crate::coordinator::RetryCoordinator) owns redelivery.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use chainledger_core::error::LedgerError;
use chainledger_core::types::{ChainId, MessageStatus, OutboundMessage};

use crate::adapter::{BridgeAdapter, DeliveryStatus};

/// Routes outbound messages to registered bridge adapters.
pub struct BridgeRouter {
    source_chain: ChainId,
    adapters: RwLock<Vec<Arc<dyn BridgeAdapter>>>,
    preferred: RwLock<HashMap<ChainId, String>>,
}

impl BridgeRouter {
    pub fn new(source_chain: ChainId) -> Self {
        Self {
            source_chain,
            adapters: RwLock::new(Vec::new()),
            preferred: RwLock::new(HashMap::new()),
        }
    }

    pub fn source_chain(&self) -> ChainId {
        self.source_chain
    }

    /// Register an adapter. Order of registration is the fallback order.
    pub fn register_adapter(&self, adapter: Arc<dyn BridgeAdapter>) -> Result<(), LedgerError> {
        let mut adapters = self.adapters.write().map_err(poisoned)?;
        if adapters.iter().any(|a| a.protocol() == adapter.protocol()) {
            return Err(LedgerError::Other(format!(
                "adapter '{}' already registered",
                adapter.protocol()
            )));
        }
        info!(protocol = adapter.protocol(), position = adapters.len(), "Bridge adapter registered");
        adapters.push(adapter);
        Ok(())
    }

    /// Prefer `protocol` for messages to `dest_chain`.
    pub fn set_preferred(&self, dest_chain: ChainId, protocol: &str) -> Result<(), LedgerError> {
        if self.adapter_by_name(protocol)?.is_none() {
            return Err(LedgerError::UnknownProtocol(protocol.to_string()));
        }
        self.preferred
            .write()
            .map_err(poisoned)?
            .insert(dest_chain, protocol.to_string());
        Ok(())
    }

    pub fn protocols(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .adapters
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|a| a.protocol().to_string())
            .collect())
    }

    /// Apply the selection rule for `dest_chain`.
    pub fn select(&self, dest_chain: ChainId) -> Result<Arc<dyn BridgeAdapter>, LedgerError> {
        let preferred = self.preferred.read().map_err(poisoned)?.get(&dest_chain).cloned();
        if let Some(name) = preferred {
            if let Some(adapter) = self.adapter_by_name(&name)? {
                if adapter.is_chain_supported(dest_chain) {
                    return Ok(adapter);
                }
                debug!(dest_chain, protocol = %name, "Preferred adapter does not support destination");
            }
        }
        self.adapters
            .read()
            .map_err(poisoned)?
            .iter()
            .find(|a| a.is_chain_supported(dest_chain))
            .cloned()
            .ok_or(LedgerError::UnsupportedChain(dest_chain))
    }

    /// `(cost, protocol)` for the adapter `send` would use.
    pub fn estimate_cost(&self, dest_chain: ChainId, payload: &[u8]) -> Result<(u128, String), LedgerError> {
        let adapter = self.select(dest_chain)?;
        let cost = adapter.estimate_gas(dest_chain, payload)?;
        Ok((cost, adapter.protocol().to_string()))
    }

    /// Send immediately through the selected adapter. Returns the message id.
    ///
    /// Untracked: nothing redelivers the message if this fails. Use
    /// [`prepare`](Self::prepare) plus the coordinator for tracked delivery.
    pub async fn send(
        &self,
        dest_chain: ChainId,
        recipient: &str,
        payload: &[u8],
        fee: u128,
    ) -> Result<String, LedgerError> {
        let message = self.prepare(dest_chain, recipient, payload.to_vec(), fee)?;
        self.dispatch(&message).await?;
        Ok(message.message_id)
    }

    /// Build a PENDING message bound to the currently selected protocol.
    pub fn prepare(
        &self,
        dest_chain: ChainId,
        recipient: &str,
        payload: Vec<u8>,
        fee: u128,
    ) -> Result<OutboundMessage, LedgerError> {
        let adapter = self.select(dest_chain)?;
        Ok(OutboundMessage {
            message_id: Uuid::new_v4().to_string(),
            source_chain: self.source_chain,
            dest_chain,
            protocol: adapter.protocol().to_string(),
            recipient: recipient.to_string(),
            payload,
            fee,
            status: MessageStatus::Pending,
            attempt_count: 0,
            next_retry_at: Utc::now(),
            receipt: None,
            sent_at: None,
            last_error: None,
        })
    }

    /// Send an existing message through the adapter it was bound to.
    pub async fn dispatch(&self, message: &OutboundMessage) -> Result<String, LedgerError> {
        let adapter = self
            .adapter_by_name(&message.protocol)?
            .ok_or_else(|| LedgerError::UnknownProtocol(message.protocol.clone()))?;
        if !adapter.is_chain_supported(message.dest_chain) {
            return Err(LedgerError::UnsupportedChain(message.dest_chain));
        }
        let receipt = adapter
            .send_message(message.dest_chain, &message.recipient, &message.payload, message.fee)
            .await?;
        info!(
            message_id = %message.message_id,
            protocol = %message.protocol,
            dest_chain = message.dest_chain,
            %receipt,
            "Message dispatched"
        );
        Ok(receipt)
    }

    /// Query delivery status through `protocol`'s adapter.
    pub async fn track_delivery(&self, protocol: &str, receipt: &str) -> Result<DeliveryStatus, LedgerError> {
        let adapter = self
            .adapter_by_name(protocol)?
            .ok_or_else(|| LedgerError::UnknownProtocol(protocol.to_string()))?;
        adapter.confirm(receipt).await
    }

    fn adapter_by_name(&self, protocol: &str) -> Result<Option<Arc<dyn BridgeAdapter>>, LedgerError> {
        Ok(self
            .adapters
            .read()
            .map_err(poisoned)?
            .iter()
            .find(|a| a.protocol() == protocol)
            .cloned())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> LedgerError {
    LedgerError::Other("router lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const A: ChainId = 10;
    const B: ChainId = 137;

    struct MockAdapter {
        name: &'static str,
        chains: HashSet<ChainId>,
        sent: Mutex<Vec<ChainId>>,
        fail: bool,
    }

    impl MockAdapter {
        fn new(name: &'static str, chains: &[ChainId]) -> Arc<Self> {
            Arc::new(Self {
                name,
                chains: chains.iter().copied().collect(),
                sent: Mutex::new(vec![]),
                fail: false,
            })
        }

        fn failing(name: &'static str, chains: &[ChainId]) -> Arc<Self> {
            Arc::new(Self {
                name,
                chains: chains.iter().copied().collect(),
                sent: Mutex::new(vec![]),
                fail: true,
            })
        }

        fn sends(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BridgeAdapter for MockAdapter {
        fn protocol(&self) -> &str {
            self.name
        }
        fn is_chain_supported(&self, chain_id: ChainId) -> bool {
            self.chains.contains(&chain_id)
        }
        fn estimate_gas(&self, _dest: ChainId, payload: &[u8]) -> Result<u128, LedgerError> {
            Ok(payload.len() as u128 * if self.name == "one" { 10 } else { 20 })
        }
        async fn send_message(
            &self,
            dest: ChainId,
            _recipient: &str,
            _payload: &[u8],
            _fee: u128,
        ) -> Result<String, LedgerError> {
            if self.fail {
                return Err(LedgerError::Adapter {
                    protocol: self.name.into(),
                    reason: "relayer down".into(),
                });
            }
            self.sent.lock().unwrap().push(dest);
            Ok(format!("{}-receipt", self.name))
        }
        async fn confirm(&self, _receipt: &str) -> Result<DeliveryStatus, LedgerError> {
            Ok(DeliveryStatus::Delivered)
        }
    }

    fn router() -> (BridgeRouter, Arc<MockAdapter>, Arc<MockAdapter>) {
        let one = MockAdapter::new("one", &[A]);
        let two = MockAdapter::new("two", &[A, B]);
        let r = BridgeRouter::new(1);
        r.register_adapter(one.clone()).unwrap();
        r.register_adapter(two.clone()).unwrap();
        (r, one, two)
    }

    #[tokio::test]
    async fn preference_selects_adapter() {
        let (r, one, two) = router();
        r.set_preferred(B, "two").unwrap();
        r.send(B, "0x01", b"x", 0).await.unwrap();
        assert_eq!(two.sends(), 1);
        assert_eq!(one.sends(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_registration_order() {
        let (r, one, two) = router();
        r.send(A, "0x01", b"x", 0).await.unwrap();
        assert_eq!(one.sends(), 1);
        assert_eq!(two.sends(), 0);
    }

    #[tokio::test]
    async fn unusable_preference_is_ignored() {
        let (r, one, _two) = router();
        let three = MockAdapter::new("three", &[B]);
        r.register_adapter(three).unwrap();
        r.set_preferred(A, "three").unwrap();
        r.send(A, "0x01", b"x", 0).await.unwrap();
        assert_eq!(one.sends(), 1);
    }

    #[tokio::test]
    async fn unsupported_destination_fails() {
        let (r, _, _) = router();
        let err = r.send(42, "0x01", b"x", 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::UnsupportedChain(42)));
        assert!(r.estimate_cost(42, b"x").is_err());
    }

    #[tokio::test]
    async fn send_failure_surfaces_without_retry() {
        let bad = MockAdapter::failing("bad", &[A]);
        let r = BridgeRouter::new(1);
        r.register_adapter(bad).unwrap();
        let err = r.send(A, "0x01", b"x", 0).await.unwrap_err();
        assert!(matches!(err, LedgerError::Adapter { .. }));
    }

    #[test]
    fn estimate_reports_protocol() {
        let (r, _, _) = router();
        r.set_preferred(A, "two").unwrap();
        assert_eq!(r.estimate_cost(A, b"abcd").unwrap(), (80, "two".to_string()));
        assert!(matches!(
            r.set_preferred(A, "nope"),
            Err(LedgerError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn prepare_binds_protocol_and_pending_state() {
        let (r, _, _) = router();
        let m = r.prepare(B, "0x01", vec![1], 5).unwrap();
        assert_eq!(m.protocol, "two");
        assert_eq!(m.status, MessageStatus::Pending);
        assert_eq!(m.attempt_count, 0);
        assert!(Uuid::parse_str(&m.message_id).is_ok());
    }

    #[test]
    fn duplicate_protocol_rejected() {
        let (r, _, _) = router();
        assert!(r.register_adapter(MockAdapter::new("one", &[B])).is_err());
    }
}
