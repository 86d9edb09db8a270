//! In-memory storage backend.
//!
//! Holds checkpoints, registered instances, replay records, ledger entries
//! and unconfirmed outbound messages in RAM. Useful for tests and
//! short-lived nodes that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chainledger_core::checkpoint::{Checkpoint, CheckpointStore};
use chainledger_core::error::LedgerError;
use chainledger_core::registry::RegistryStore;
use chainledger_core::state::{LedgerStore, OutboundStore, ReplayGuard};
use chainledger_core::types::{
    ChainId, ChainLedgerEntry, ContractInstance, LedgerKey, OutboundMessage, ReplayRecord,
};

/// In-memory node storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<ChainId, Checkpoint>>,
    instances: Mutex<BTreeMap<(ChainId, String), ContractInstance>>,
    replay: Mutex<HashMap<String, ReplayRecord>>,
    ledger: Mutex<BTreeMap<LedgerKey, ChainLedgerEntry>>,
    outbound: Mutex<BTreeMap<String, OutboundMessage>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered instances across all chains.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Number of processed inbound messages.
    pub fn replay_count(&self) -> usize {
        self.replay.lock().unwrap().len()
    }

    /// Number of stored (unconfirmed) outbound messages.
    pub fn outbound_count(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>, LedgerError> {
        Ok(self.checkpoints.lock().unwrap().get(&chain_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), LedgerError> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(checkpoint.chain_id, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), LedgerError> {
        self.checkpoints.lock().unwrap().remove(&chain_id);
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for InMemoryStorage {
    async fn insert(&self, instance: &ContractInstance) -> Result<bool, LedgerError> {
        let mut instances = self.instances.lock().unwrap();
        let key = (instance.chain_id, instance.address.clone());
        if instances.contains_key(&key) {
            return Ok(false);
        }
        instances.insert(key, instance.clone());
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<ContractInstance>, LedgerError> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }
}

#[async_trait]
impl ReplayGuard for InMemoryStorage {
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError> {
        Ok(self.replay.lock().unwrap().contains_key(message_id))
    }

    async fn record(&self, record: ReplayRecord) -> Result<bool, LedgerError> {
        let mut replay = self.replay.lock().unwrap();
        if replay.contains_key(&record.message_id) {
            return Ok(false);
        }
        replay.insert(record.message_id.clone(), record);
        Ok(true)
    }

    async fn get(&self, message_id: &str) -> Result<Option<ReplayRecord>, LedgerError> {
        Ok(self.replay.lock().unwrap().get(message_id).cloned())
    }
}

#[async_trait]
impl LedgerStore for InMemoryStorage {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ChainLedgerEntry>, LedgerError> {
        Ok(self.ledger.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, entry: ChainLedgerEntry) -> Result<(), LedgerError> {
        self.ledger.lock().unwrap().insert(entry.ledger_key(), entry);
        Ok(())
    }

    async fn entries_for(&self, account: &str) -> Result<Vec<ChainLedgerEntry>, LedgerError> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.key == account)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboundStore for InMemoryStorage {
    async fn put_outbound(&self, message: &OutboundMessage) -> Result<(), LedgerError> {
        self.outbound
            .lock()
            .unwrap()
            .insert(message.message_id.clone(), message.clone());
        Ok(())
    }

    async fn remove_outbound(&self, message_id: &str) -> Result<(), LedgerError> {
        self.outbound.lock().unwrap().remove(message_id);
        Ok(())
    }

    async fn load_outbound(&self) -> Result<Vec<OutboundMessage>, LedgerError> {
        Ok(self.outbound.lock().unwrap().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = InMemoryStorage::new();
        store
            .save(Checkpoint {
                chain_id: 137,
                block_number: 1000,
                updated_at: 0,
            })
            .await
            .unwrap();
        let loaded = CheckpointStore::load(&store, 137).await.unwrap().unwrap();
        assert_eq!(loaded.block_number, 1000);
        store.delete(137).await.unwrap();
        assert!(CheckpointStore::load(&store, 137).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn registry_insert_is_first_wins() {
        let store = InMemoryStorage::new();
        assert!(store.insert(&ContractInstance::new("0xaaa", 1, 100)).await.unwrap());
        assert!(!store.insert(&ContractInstance::new("0xAAA", 1, 200)).await.unwrap());
        assert!(store.insert(&ContractInstance::new("0xaaa", 2, 5)).await.unwrap());

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].discovered_at_block, 100);
    }

    #[tokio::test]
    async fn replay_record_once() {
        let store = InMemoryStorage::new();
        let rec = ReplayRecord {
            message_id: "m-1".into(),
            processed_at: 1,
        };
        assert!(store.record(rec.clone()).await.unwrap());
        assert!(!store.record(rec).await.unwrap());
        assert!(store.is_processed("m-1").await.unwrap());
        assert_eq!(store.replay_count(), 1);
    }

    #[tokio::test]
    async fn ledger_entries_by_account() {
        let store = InMemoryStorage::new();
        for chain in [1, 10, 137] {
            let mut e = ChainLedgerEntry::empty(&LedgerKey::new(chain, "alice"));
            e.collateral = chain as u128;
            store.put(e).await.unwrap();
        }
        store
            .put(ChainLedgerEntry::empty(&LedgerKey::new(1, "bob")))
            .await
            .unwrap();

        let alice = store.entries_for("alice").await.unwrap();
        assert_eq!(alice.len(), 3);
        let got = LedgerStore::get(&store, &LedgerKey::new(10, "alice")).await.unwrap();
        assert_eq!(got.unwrap().collateral, 10);
    }
}
