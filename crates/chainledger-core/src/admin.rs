//! Operator control surface: inspect streams and force-set checkpoints.
//!
//! Force-set is the one path allowed to move a checkpoint backwards (backfill)
//! or forwards past unscanned blocks (skip). The response reports the before
//! and after values plus block lag so operators can confirm the action.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::error::LedgerError;
use crate::registry::ContractRegistry;
use crate::source::ChainLogSource;
use crate::types::{BlockNumber, ChainId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceCheckpointRequest {
    pub chain_id: ChainId,
    pub block: BlockNumber,
    #[serde(default)]
    pub secret: Option<String>,
    /// Head supplied by the operator when no live source is attached.
    #[serde(default)]
    pub observed_head: Option<BlockNumber>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceCheckpointResponse {
    pub chain_id: ChainId,
    pub before: Option<BlockNumber>,
    pub after: BlockNumber,
    pub head: Option<BlockNumber>,
    pub lag: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub chain_id: ChainId,
    pub cursor: Option<BlockNumber>,
    pub head: Option<BlockNumber>,
    pub lag: Option<u64>,
    pub contracts: usize,
}

pub struct AdminService {
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Option<Arc<ContractRegistry>>,
    sources: HashMap<ChainId, Arc<dyn ChainLogSource>>,
    shared_secret: Option<String>,
}

impl AdminService {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, shared_secret: Option<String>) -> Self {
        Self {
            checkpoints,
            registry: None,
            sources: HashMap::new(),
            shared_secret: shared_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<ContractRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach a live source so responses report the real head.
    pub fn with_source(mut self, source: Arc<dyn ChainLogSource>) -> Self {
        self.sources.insert(source.chain_id(), source);
        self
    }

    pub async fn force_checkpoint(
        &self,
        req: ForceCheckpointRequest,
    ) -> Result<ForceCheckpointResponse, LedgerError> {
        self.authorize(req.secret.as_deref())?;
        let head = self.head(req.chain_id, req.observed_head).await?;

        let mgr = CheckpointManager::new(self.checkpoints.clone(), req.chain_id);
        let before = mgr.force_set(req.block).await?;

        Ok(ForceCheckpointResponse {
            chain_id: req.chain_id,
            before,
            after: req.block,
            head,
            lag: head.map(|h| h.saturating_sub(req.block)),
        })
    }

    pub async fn status(
        &self,
        chain_id: ChainId,
        observed_head: Option<BlockNumber>,
    ) -> Result<StreamStatus, LedgerError> {
        let cursor = self.checkpoints.load(chain_id).await?.map(|cp| cp.block_number);
        let head = self.head(chain_id, observed_head).await?;
        let contracts = match &self.registry {
            Some(r) => r.len(chain_id).await,
            None => 0,
        };
        Ok(StreamStatus {
            chain_id,
            cursor,
            head,
            lag: head.map(|h| h.saturating_sub(cursor.unwrap_or(0))),
            contracts,
        })
    }

    async fn head(
        &self,
        chain_id: ChainId,
        observed: Option<BlockNumber>,
    ) -> Result<Option<BlockNumber>, LedgerError> {
        match self.sources.get(&chain_id) {
            Some(source) => Ok(Some(source.get_block_number().await?)),
            None => Ok(observed),
        }
    }

    fn authorize(&self, provided: Option<&str>) -> Result<(), LedgerError> {
        let Some(expected) = &self.shared_secret else {
            return Ok(());
        };
        match provided {
            Some(p) if constant_time_eq(p.as_bytes(), expected.as_bytes()) => Ok(()),
            Some(_) => Err(LedgerError::Unauthorized("shared secret mismatch".into())),
            None => Err(LedgerError::Unauthorized("shared secret required".into())),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::source::LogQuery;
    use crate::types::RawEvent;
    use async_trait::async_trait;

    struct FixedHead(BlockNumber);

    #[async_trait]
    impl ChainLogSource for FixedHead {
        fn chain_id(&self) -> ChainId {
            1
        }
        async fn get_block_number(&self) -> Result<BlockNumber, LedgerError> {
            Ok(self.0)
        }
        async fn get_logs(&self, _q: &LogQuery) -> Result<Vec<RawEvent>, LedgerError> {
            Ok(vec![])
        }
    }

    fn request(block: BlockNumber, secret: Option<&str>) -> ForceCheckpointRequest {
        ForceCheckpointRequest {
            chain_id: 1,
            block,
            secret: secret.map(String::from),
            observed_head: None,
        }
    }

    #[tokio::test]
    async fn force_set_reports_before_after_and_lag() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let admin = AdminService::new(store.clone(), None).with_source(Arc::new(FixedHead(1_000)));

        CheckpointManager::new(store, 1).advance(900).await.unwrap();
        let resp = admin.force_checkpoint(request(750, None)).await.unwrap();

        assert_eq!(
            resp,
            ForceCheckpointResponse {
                chain_id: 1,
                before: Some(900),
                after: 750,
                head: Some(1_000),
                lag: Some(250),
            }
        );
    }

    #[tokio::test]
    async fn secret_is_enforced() {
        let admin = AdminService::new(Arc::new(MemoryCheckpointStore::new()), Some("s3cret".into()));

        let missing = admin.force_checkpoint(request(5, None)).await.unwrap_err();
        let wrong = admin.force_checkpoint(request(5, Some("nope"))).await.unwrap_err();
        assert!(matches!(missing, LedgerError::Unauthorized(_)));
        assert!(matches!(wrong, LedgerError::Unauthorized(_)));

        let ok = admin.force_checkpoint(request(5, Some("s3cret"))).await.unwrap();
        assert_eq!(ok.before, None);
        assert_eq!(ok.lag, None);
    }

    #[tokio::test]
    async fn status_uses_observed_head_without_source() {
        let store = Arc::new(MemoryCheckpointStore::new());
        CheckpointManager::new(store.clone(), 5).advance(40).await.unwrap();
        let admin = AdminService::new(store, None);

        let status = admin.status(5, Some(100)).await.unwrap();
        assert_eq!(status.cursor, Some(40));
        assert_eq!(status.lag, Some(60));
    }
}
