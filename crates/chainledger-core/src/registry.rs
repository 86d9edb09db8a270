//! Contract registry — the append-only set of monitored contract instances.
//!
//! Instances are discovered from factory deployment events. Every insert is
//! persisted before it becomes visible to the scanner, so a crash never loses
//! an address that has already been scanned past.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::LedgerError;
use crate::types::{normalize_address, BlockNumber, ChainId, ContractInstance, Registration};

/// Persistence for the registry.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Durably insert an instance. Returns `false` if the address was already stored.
    async fn insert(&self, instance: &ContractInstance) -> Result<bool, LedgerError>;

    /// Load every stored instance across all chains.
    async fn load_all(&self) -> Result<Vec<ContractInstance>, LedgerError>;
}

/// In-memory index over a [`RegistryStore`].
pub struct ContractRegistry {
    store: Arc<dyn RegistryStore>,
    chains: RwLock<HashMap<ChainId, BTreeMap<String, ContractInstance>>>,
}

impl ContractRegistry {
    /// Hydrate a registry from its store.
    pub async fn load(store: Arc<dyn RegistryStore>) -> Result<Self, LedgerError> {
        let mut chains: HashMap<ChainId, BTreeMap<String, ContractInstance>> = HashMap::new();
        for instance in store.load_all().await? {
            chains
                .entry(instance.chain_id)
                .or_default()
                .entry(instance.address.clone())
                .or_insert(instance);
        }
        let count: usize = chains.values().map(|m| m.len()).sum();
        tracing::info!(instances = count, "Contract registry loaded");
        Ok(Self {
            store,
            chains: RwLock::new(chains),
        })
    }

    /// Register an instance. Idempotent: a known address reports `newly_added = false`.
    pub async fn register(
        &self,
        address: &str,
        chain_id: ChainId,
        discovered_at_block: BlockNumber,
    ) -> Result<Registration, LedgerError> {
        let instance = ContractInstance::new(address, chain_id, discovered_at_block);
        let mut chains = self.chains.write().await;
        let known = chains
            .get(&chain_id)
            .is_some_and(|m| m.contains_key(&instance.address));
        if known {
            return Ok(Registration { newly_added: false });
        }

        // Persist first; the in-memory view only changes once the store has it.
        self.store.insert(&instance).await?;
        tracing::info!(
            chain_id,
            address = %instance.address,
            block = discovered_at_block,
            "Registered contract instance"
        );
        chains
            .entry(chain_id)
            .or_default()
            .insert(instance.address.clone(), instance);
        Ok(Registration { newly_added: true })
    }

    /// Snapshot of the addresses monitored on a chain.
    pub async fn all(&self, chain_id: ChainId) -> BTreeSet<String> {
        self.chains
            .read()
            .await
            .get(&chain_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the full instance records on a chain.
    pub async fn instances(&self, chain_id: ChainId) -> Vec<ContractInstance> {
        self.chains
            .read()
            .await
            .get(&chain_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, chain_id: ChainId, address: &str) -> bool {
        let address = normalize_address(address);
        self.chains
            .read()
            .await
            .get(&chain_id)
            .is_some_and(|m| m.contains_key(&address))
    }

    /// Number of instances on a chain.
    pub async fn len(&self, chain_id: ChainId) -> usize {
        self.chains.read().await.get(&chain_id).map_or(0, |m| m.len())
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory registry store.
#[derive(Default)]
pub struct MemoryRegistryStore {
    data: std::sync::Mutex<Vec<ContractInstance>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn insert(&self, instance: &ContractInstance) -> Result<bool, LedgerError> {
        let mut data = self.data.lock().unwrap();
        if data
            .iter()
            .any(|i| i.chain_id == instance.chain_id && i.address == instance.address)
        {
            return Ok(false);
        }
        data.push(instance.clone());
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<ContractInstance>, LedgerError> {
        Ok(self.data.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = ContractRegistry::load(Arc::new(MemoryRegistryStore::new()))
            .await
            .unwrap();

        let first = registry.register("0xAAA", 1, 100).await.unwrap();
        let second = registry.register("0xaaa", 1, 105).await.unwrap();

        assert!(first.newly_added);
        assert!(!second.newly_added);
        assert_eq!(registry.len(1).await, 1);
        // First discovery block wins.
        assert_eq!(registry.instances(1).await[0].discovered_at_block, 100);
    }

    #[tokio::test]
    async fn chains_are_isolated() {
        let registry = ContractRegistry::load(Arc::new(MemoryRegistryStore::new()))
            .await
            .unwrap();
        registry.register("0xaaa", 1, 1).await.unwrap();
        registry.register("0xaaa", 10, 1).await.unwrap();
        registry.register("0xbbb", 10, 2).await.unwrap();

        assert_eq!(registry.all(1).await.len(), 1);
        assert_eq!(registry.all(10).await.len(), 2);
        assert!(registry.all(137).await.is_empty());
        assert!(registry.contains(10, "0xBBB").await);
    }

    #[tokio::test]
    async fn reload_restores_instances() {
        let store: Arc<dyn RegistryStore> = Arc::new(MemoryRegistryStore::new());
        {
            let registry = ContractRegistry::load(store.clone()).await.unwrap();
            registry.register("0xaaa", 1, 100).await.unwrap();
        }
        let registry = ContractRegistry::load(store).await.unwrap();
        assert!(registry.contains(1, "0xaaa").await);
    }
}
