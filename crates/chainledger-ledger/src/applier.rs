//! Ledger state applier — applies inbound cross-chain updates exactly once.
//!
//! # Apply
//! 1. Take the message-id lock, then the per-ledger-key lock
//!    (`(source_chain, account)`).
//! 2. Consult the replay guard; a processed id is a successful no-op.
//!    The id lock makes this check-then-record atomic even when two copies
//!    of one id carry different accounts.
//! 3. Compute the new entry: SYNC_STATE assigns, INCREMENT adds a delta.
//! 4. Write the entry, then record the message id.
//!
//! A crash between steps 4's two writes leaves the entry updated but the id
//! unrecorded. Redelivery of a SYNC_STATE message then re-assigns the same
//! values; redelivery of an INCREMENT double-counts. That window is the reason
//! INCREMENT can be switched off with `accept_legacy_increment = false`.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chainledger_core::error::LedgerError;
use chainledger_core::state::{LedgerStore, ReplayGuard};
use chainledger_core::types::{ChainId, ChainLedgerEntry, InboundMessage, LedgerKey, LedgerUpdate, ReplayRecord};

use crate::locks::KeyedLocks;

/// Applier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplierConfig {
    /// The chain this node runs on; its entries change only through local mutations.
    pub local_chain_id: ChainId,
    /// Accept legacy INCREMENT updates from older deployments.
    pub accept_legacy_increment: bool,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            local_chain_id: 1,
            accept_legacy_increment: true,
        }
    }
}

/// Result of applying an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The ledger was mutated; carries the resulting entry.
    Applied(ChainLedgerEntry),
    /// The message id was already processed; nothing changed.
    Replayed,
}

/// Applies [`InboundMessage`]s to the ledger behind a replay guard.
pub struct LedgerApplier {
    pub(crate) config: ApplierConfig,
    pub(crate) ledger: Arc<dyn LedgerStore>,
    guard: Arc<dyn ReplayGuard>,
    message_locks: KeyedLocks<String>,
    pub(crate) key_locks: KeyedLocks<LedgerKey>,
}

impl LedgerApplier {
    pub fn new(config: ApplierConfig, ledger: Arc<dyn LedgerStore>, guard: Arc<dyn ReplayGuard>) -> Self {
        Self {
            config,
            ledger,
            guard,
            message_locks: KeyedLocks::new(),
            key_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    /// Apply one inbound message. Safe to call with duplicates.
    pub async fn apply(&self, msg: &InboundMessage) -> Result<ApplyOutcome, LedgerError> {
        if msg.source_chain == self.config.local_chain_id {
            return Err(LedgerError::Unauthorized(format!(
                "message {} claims to originate from the local chain {}",
                msg.message_id, msg.source_chain
            )));
        }

        let key = msg.ledger_key();
        let _id_held = self.message_locks.lock(&msg.message_id).await;
        let _key_held = self.key_locks.lock(&key).await;

        if self.guard.is_processed(&msg.message_id).await? {
            info!(message_id = %msg.message_id, key = %key, "Replay detected, skipping");
            return Ok(ApplyOutcome::Replayed);
        }

        let current = self
            .ledger
            .get(&key)
            .await?
            .unwrap_or_else(|| ChainLedgerEntry::empty(&key));

        let mut next = match &msg.update {
            LedgerUpdate::SyncState { collateral, borrowed } => ChainLedgerEntry {
                collateral: *collateral,
                borrowed: *borrowed,
                ..current.clone()
            },
            LedgerUpdate::Increment {
                collateral_delta,
                borrowed_delta,
            } => {
                if !self.config.accept_legacy_increment {
                    return Err(LedgerError::LegacyUpdateRejected(msg.message_id.clone()));
                }
                warn!(message_id = %msg.message_id, key = %key, "Applying legacy INCREMENT update");
                ChainLedgerEntry {
                    collateral: add_delta(current.collateral, *collateral_delta, &msg.account, "collateral")?,
                    borrowed: add_delta(current.borrowed, *borrowed_delta, &msg.account, "borrowed")?,
                    ..current.clone()
                }
            }
        };
        next.updated_at = Utc::now().timestamp();

        self.ledger.put(next.clone()).await?;
        self.guard
            .record(ReplayRecord {
                message_id: msg.message_id.clone(),
                processed_at: next.updated_at,
            })
            .await?;

        debug!(
            message_id = %msg.message_id,
            key = %key,
            collateral = %next.collateral,
            borrowed = %next.borrowed,
            "Inbound update applied"
        );
        Ok(ApplyOutcome::Applied(next))
    }
}

pub(crate) fn add_delta(value: u128, delta: i128, account: &str, field: &'static str) -> Result<u128, LedgerError> {
    let result = if delta >= 0 {
        value.checked_add(delta.unsigned_abs())
    } else {
        value.checked_sub(delta.unsigned_abs())
    };
    result.ok_or_else(|| LedgerError::LedgerOverflow {
        account: account.to_string(),
        field,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainledger_storage::InMemoryStorage;

    fn applier(accept_legacy: bool) -> (LedgerApplier, Arc<InMemoryStorage>) {
        let store = Arc::new(InMemoryStorage::new());
        let applier = LedgerApplier::new(
            ApplierConfig {
                local_chain_id: 1,
                accept_legacy_increment: accept_legacy,
            },
            store.clone(),
            store.clone(),
        );
        (applier, store)
    }

    fn sync(id: &str, collateral: u128, borrowed: u128) -> InboundMessage {
        InboundMessage {
            message_id: id.into(),
            source_chain: 10,
            account: "alice".into(),
            update: LedgerUpdate::SyncState { collateral, borrowed },
        }
    }

    fn incr(id: &str, collateral_delta: i128) -> InboundMessage {
        InboundMessage {
            message_id: id.into(),
            source_chain: 10,
            account: "alice".into(),
            update: LedgerUpdate::Increment {
                collateral_delta,
                borrowed_delta: 0,
            },
        }
    }

    #[test]
    fn delta_arithmetic() {
        assert_eq!(add_delta(10, 5, "a", "collateral").unwrap(), 15);
        assert_eq!(add_delta(10, -10, "a", "collateral").unwrap(), 0);
        assert!(add_delta(10, -11, "a", "collateral").is_err());
        assert!(add_delta(u128::MAX, 1, "a", "collateral").is_err());
    }

    #[tokio::test]
    async fn replay_is_a_no_op() {
        let (a, store) = applier(true);
        let msg = incr("m-1", 100);
        assert!(matches!(a.apply(&msg).await.unwrap(), ApplyOutcome::Applied(_)));
        assert_eq!(a.apply(&msg).await.unwrap(), ApplyOutcome::Replayed);

        let entry = LedgerStore::get(store.as_ref(), &LedgerKey::new(10, "alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.collateral, 100);
    }

    #[tokio::test]
    async fn legacy_increment_can_be_disabled() {
        let (a, store) = applier(false);
        let err = a.apply(&incr("m-1", 5)).await.unwrap_err();
        assert!(matches!(err, LedgerError::LegacyUpdateRejected(_)));
        assert!(!store.is_processed("m-1").await.unwrap());
        assert!(matches!(a.apply(&sync("m-2", 5, 0)).await.unwrap(), ApplyOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn underflow_leaves_state_untouched() {
        let (a, store) = applier(true);
        a.apply(&sync("m-1", 50, 0)).await.unwrap();
        assert!(a.apply(&incr("m-2", -51)).await.is_err());
        assert!(!store.is_processed("m-2").await.unwrap());
        let entry = LedgerStore::get(store.as_ref(), &LedgerKey::new(10, "alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.collateral, 50);
    }

    #[tokio::test]
    async fn same_id_for_two_accounts_applies_once() {
        let (a, store) = applier(true);
        let a = Arc::new(a);
        let mut bob = sync("m-1", 9, 0);
        bob.account = "bob".into();

        let tasks: Vec<_> = [sync("m-1", 7, 0), bob]
            .into_iter()
            .map(|msg| {
                let a = a.clone();
                tokio::spawn(async move { a.apply(&msg).await.unwrap() })
            })
            .collect();
        let mut applied = 0;
        for t in tasks {
            if matches!(t.await.unwrap(), ApplyOutcome::Applied(_)) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(store.replay_count(), 1);
        let alice = store.entries_for("alice").await.unwrap().len();
        let bob = store.entries_for("bob").await.unwrap().len();
        assert_eq!(alice + bob, 1);
    }

    #[tokio::test]
    async fn lock_tables_drain_after_apply() {
        let (a, _) = applier(true);
        for i in 0..50u128 {
            let mut msg = sync(&format!("m-{i}"), i, 0);
            msg.account = format!("acct-{i}");
            a.apply(&msg).await.unwrap();
        }
        assert_eq!(a.message_locks.len(), 0);
        assert_eq!(a.key_locks.len(), 0);
    }

    #[tokio::test]
    async fn local_chain_messages_rejected() {
        let (a, _) = applier(true);
        let mut msg = sync("m-1", 1, 0);
        msg.source_chain = 1;
        assert!(matches!(a.apply(&msg).await, Err(LedgerError::Unauthorized(_))));
    }
}
