//! Global credit line and local-chain mutations.
//!
//! The credit line of an account is `Σ (collateral - borrowed)` over every
//! chain's entry. Local mutations change only the entry keyed by the node's own
//! chain and each one yields a [`StateBroadcast`] carrying the new absolute
//! values for the other chains.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use chainledger_core::error::LedgerError;
use chainledger_core::types::{ChainId, ChainLedgerEntry, InboundMessage, LedgerKey, LedgerUpdate};

use crate::applier::LedgerApplier;

/// Absolute state of one account on the local chain, ready for a bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBroadcast {
    pub source_chain: ChainId,
    pub account: String,
    pub collateral: u128,
    pub borrowed: u128,
    pub issued_at: i64,
}

/// Wire body of a state broadcast. The source chain travels in the bridge
/// envelope, not in the payload.
#[derive(Debug, Serialize, Deserialize)]
struct BroadcastPayload {
    account: String,
    update: LedgerUpdate,
}

impl StateBroadcast {
    fn from_entry(entry: &ChainLedgerEntry) -> Self {
        Self {
            source_chain: entry.chain_id,
            account: entry.key.clone(),
            collateral: entry.collateral,
            borrowed: entry.borrowed,
            issued_at: entry.updated_at,
        }
    }

    pub fn update(&self) -> LedgerUpdate {
        LedgerUpdate::SyncState {
            collateral: self.collateral,
            borrowed: self.borrowed,
        }
    }

    /// JSON payload handed to the bridge router.
    pub fn payload(&self) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec(&BroadcastPayload {
            account: self.account.clone(),
            update: self.update(),
        })?)
    }

    /// The message a destination chain builds from this broadcast.
    pub fn to_inbound(&self, message_id: impl Into<String>) -> InboundMessage {
        InboundMessage {
            message_id: message_id.into(),
            source_chain: self.source_chain,
            account: self.account.clone(),
            update: self.update(),
        }
    }
}

/// Decode a delivered payload into an [`InboundMessage`].
pub fn decode_inbound(message_id: &str, source_chain: ChainId, payload: &[u8]) -> Result<InboundMessage, LedgerError> {
    let body: BroadcastPayload = serde_json::from_slice(payload)
        .map_err(|e| LedgerError::Decode(format!("message {message_id}: {e}")))?;
    Ok(InboundMessage {
        message_id: message_id.to_string(),
        source_chain,
        account: body.account,
        update: body.update,
    })
}

#[derive(Debug, Clone, Copy)]
enum LocalOp {
    Deposit,
    Withdraw,
    Borrow,
    Repay,
}

impl LocalOp {
    fn name(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::Borrow => "borrow",
            Self::Repay => "repay",
        }
    }

    /// Operations that shrink the credit line must keep it non-negative.
    fn draws_credit(self) -> bool {
        matches!(self, Self::Withdraw | Self::Borrow)
    }
}

impl LedgerApplier {
    /// Global credit line: `Σ (collateral - borrowed)` over every chain.
    pub async fn credit_line(&self, account: &str) -> Result<i128, LedgerError> {
        sum_net(account, &self.ledger.entries_for(account).await?)
    }

    /// Every chain's entry for `account`, ordered by chain id.
    pub async fn positions(&self, account: &str) -> Result<Vec<ChainLedgerEntry>, LedgerError> {
        let mut entries = self.ledger.entries_for(account).await?;
        entries.sort_by_key(|e| e.chain_id);
        Ok(entries)
    }

    pub async fn local_deposit(&self, account: &str, amount: u128) -> Result<StateBroadcast, LedgerError> {
        self.mutate_local(account, LocalOp::Deposit, amount).await
    }

    pub async fn local_withdraw(&self, account: &str, amount: u128) -> Result<StateBroadcast, LedgerError> {
        self.mutate_local(account, LocalOp::Withdraw, amount).await
    }

    pub async fn local_borrow(&self, account: &str, amount: u128) -> Result<StateBroadcast, LedgerError> {
        self.mutate_local(account, LocalOp::Borrow, amount).await
    }

    pub async fn local_repay(&self, account: &str, amount: u128) -> Result<StateBroadcast, LedgerError> {
        self.mutate_local(account, LocalOp::Repay, amount).await
    }

    async fn mutate_local(&self, account: &str, op: LocalOp, amount: u128) -> Result<StateBroadcast, LedgerError> {
        let key = LedgerKey::new(self.config.local_chain_id, account);
        let _held = self.key_locks.lock(&key).await;

        if op.draws_credit() {
            let available = self.credit_line(account).await?;
            let fits = u128::try_from(available).map(|a| a >= amount).unwrap_or(false);
            if !fits {
                return Err(LedgerError::CreditLineExceeded {
                    account: account.to_string(),
                    available,
                    requested: amount,
                });
            }
        }

        let mut entry = self
            .ledger
            .get(&key)
            .await?
            .unwrap_or_else(|| ChainLedgerEntry::empty(&key));
        let overflow = |field| LedgerError::LedgerOverflow {
            account: account.to_string(),
            field,
        };
        match op {
            LocalOp::Deposit => {
                entry.collateral = entry.collateral.checked_add(amount).ok_or_else(|| overflow("collateral"))?
            }
            LocalOp::Withdraw => {
                entry.collateral = entry.collateral.checked_sub(amount).ok_or_else(|| overflow("collateral"))?
            }
            LocalOp::Borrow => entry.borrowed = entry.borrowed.checked_add(amount).ok_or_else(|| overflow("borrowed"))?,
            LocalOp::Repay => entry.borrowed = entry.borrowed.checked_sub(amount).ok_or_else(|| overflow("borrowed"))?,
        }
        entry.updated_at = Utc::now().timestamp();
        self.ledger.put(entry.clone()).await?;

        info!(
            account,
            op = op.name(),
            %amount,
            collateral = %entry.collateral,
            borrowed = %entry.borrowed,
            "Local ledger mutation"
        );
        Ok(StateBroadcast::from_entry(&entry))
    }
}

fn sum_net(account: &str, entries: &[ChainLedgerEntry]) -> Result<i128, LedgerError> {
    entries.iter().try_fold(0i128, |acc, e| {
        acc.checked_add(e.net()).ok_or_else(|| LedgerError::LedgerOverflow {
            account: account.to_string(),
            field: "credit_line",
        })
    })
}
