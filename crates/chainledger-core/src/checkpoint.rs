//! Checkpoint manager — persists each chain stream's position for crash recovery.
//!
//! A checkpoint stores the last block whose events were all durably published.
//! On restart the scanner resumes from it; at most one already-published batch
//! is scanned again and the publisher's dedup key absorbs the repeat.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::types::{BlockNumber, ChainId};

/// A persisted checkpoint for one chain stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: ChainId,
    /// Last durably processed block.
    pub block_number: BlockNumber,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include `MemoryCheckpointStore`, `InMemoryStorage`,
/// `FileStorage` and `SqliteStorage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a chain.
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>, LedgerError>;

    /// Save (upsert) a checkpoint. Must be durable when it returns.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), LedgerError>;

    /// Delete a checkpoint (e.g. when resetting a stream).
    async fn delete(&self, chain_id: ChainId) -> Result<(), LedgerError>;
}

/// Manages checkpoint reads/writes for one chain stream.
///
/// Owned by the single scanning task for that chain, so advancement is
/// strictly sequential.
pub struct CheckpointManager {
    store: std::sync::Arc<dyn CheckpointStore>,
    chain_id: ChainId,
}

impl CheckpointManager {
    pub fn new(store: std::sync::Arc<dyn CheckpointStore>, chain_id: ChainId) -> Self {
        Self { store, chain_id }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Load the saved block (returns `None` if the stream has never advanced).
    pub async fn load(&self) -> Result<Option<BlockNumber>, LedgerError> {
        Ok(self.store.load(self.chain_id).await?.map(|cp| cp.block_number))
    }

    /// Advance the checkpoint to `to_block`.
    ///
    /// Call only after every event in the scanned range has been published.
    /// Rejects any attempt to move backwards.
    pub async fn advance(&self, to_block: BlockNumber) -> Result<(), LedgerError> {
        if let Some(current) = self.load().await? {
            if to_block < current {
                return Err(LedgerError::CheckpointRegression {
                    chain_id: self.chain_id,
                    current,
                    requested: to_block,
                });
            }
            if to_block == current {
                return Ok(());
            }
        }
        self.write(to_block).await
    }

    /// Set the checkpoint unconditionally (operator recovery / backfill).
    ///
    /// Returns the previous value.
    pub async fn force_set(&self, block: BlockNumber) -> Result<Option<BlockNumber>, LedgerError> {
        let before = self.load().await?;
        self.write(block).await?;
        tracing::warn!(chain_id = self.chain_id, ?before, after = block, "Checkpoint force-set");
        Ok(before)
    }

    async fn write(&self, block_number: BlockNumber) -> Result<(), LedgerError> {
        let cp = Checkpoint {
            chain_id: self.chain_id,
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cp).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral streams.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<ChainId, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>, LedgerError> {
        Ok(self.data.lock().unwrap().get(&chain_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), LedgerError> {
        self.data.lock().unwrap().insert(checkpoint.chain_id, checkpoint);
        Ok(())
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), LedgerError> {
        self.data.lock().unwrap().remove(&chain_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let mgr = CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), 1);

        assert!(mgr.load().await.unwrap().is_none());

        mgr.advance(1000).await.unwrap();
        assert_eq!(mgr.load().await.unwrap(), Some(1000));
    }

    #[tokio::test]
    async fn advance_rejects_regression() {
        let mgr = CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), 1);
        mgr.advance(50).await.unwrap();

        let err = mgr.advance(49).await.unwrap_err();
        assert!(matches!(err, LedgerError::CheckpointRegression { current: 50, requested: 49, .. }));
        assert_eq!(mgr.load().await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn force_set_may_rewind() {
        let mgr = CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), 7);
        mgr.advance(500).await.unwrap();

        let before = mgr.force_set(120).await.unwrap();
        assert_eq!(before, Some(500));
        assert_eq!(mgr.load().await.unwrap(), Some(120));
    }
}
