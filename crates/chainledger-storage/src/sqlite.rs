//! SQLite storage backend for ChainLedger.
//!
//! Persists checkpoints, registered instances, replay records, ledger
//! entries and unconfirmed outbound messages to a single SQLite file. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use chainledger_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStorage::open("./ledger.db").await?;
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainledger_core::checkpoint::{Checkpoint, CheckpointStore};
use chainledger_core::error::LedgerError;
use chainledger_core::registry::RegistryStore;
use chainledger_core::state::{LedgerStore, OutboundStore, ReplayGuard};
use chainledger_core::types::{
    ChainId, ChainLedgerEntry, ContractInstance, LedgerKey, OutboundMessage, ReplayRecord,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS checkpoints (
        chain_id     INTEGER PRIMARY KEY,
        block_number INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS instances (
        chain_id            INTEGER NOT NULL,
        address             TEXT    NOT NULL,
        discovered_at_block INTEGER NOT NULL,
        PRIMARY KEY (chain_id, address)
    );",
    "CREATE TABLE IF NOT EXISTS replay_guard (
        message_id   TEXT    PRIMARY KEY,
        processed_at INTEGER NOT NULL
    );",
    // u128 amounts are stored as decimal text.
    "CREATE TABLE IF NOT EXISTS ledger (
        chain_id   INTEGER NOT NULL,
        account    TEXT    NOT NULL,
        collateral TEXT    NOT NULL,
        borrowed   TEXT    NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (chain_id, account)
    );",
    "CREATE INDEX IF NOT EXISTS idx_ledger_account ON ledger (account);",
    "CREATE TABLE IF NOT EXISTS outbound (
        message_id TEXT PRIMARY KEY,
        status     TEXT NOT NULL,
        body       TEXT NOT NULL
    );",
];

fn storage_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

/// SQLite-backed storage.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema(true).await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to one connection: each `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema(false).await?;
        Ok(storage)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), LedgerError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }
}

fn parse_amount(raw: &str, field: &'static str, account: &str) -> Result<u128, LedgerError> {
    raw.parse::<u128>().map_err(|_| LedgerError::LedgerOverflow {
        account: account.to_string(),
        field,
    })
}

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>, LedgerError> {
        let row = sqlx::query("SELECT block_number, updated_at FROM checkpoints WHERE chain_id = ?")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| Checkpoint {
            chain_id,
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO checkpoints (chain_id, block_number, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(chain_id) DO UPDATE SET
                block_number = excluded.block_number,
                updated_at   = excluded.updated_at",
        )
        .bind(checkpoint.chain_id as i64)
        .bind(checkpoint.block_number as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(chain_id = checkpoint.chain_id, block = checkpoint.block_number, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM checkpoints WHERE chain_id = ?")
            .bind(chain_id as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for SqliteStorage {
    async fn insert(&self, instance: &ContractInstance) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO instances (chain_id, address, discovered_at_block) VALUES (?, ?, ?)",
        )
        .bind(instance.chain_id as i64)
        .bind(&instance.address)
        .bind(instance.discovered_at_block as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_all(&self) -> Result<Vec<ContractInstance>, LedgerError> {
        let rows = sqlx::query(
            "SELECT chain_id, address, discovered_at_block FROM instances ORDER BY chain_id, address",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| ContractInstance {
                chain_id: r.get::<i64, _>("chain_id") as u64,
                address: r.get("address"),
                discovered_at_block: r.get::<i64, _>("discovered_at_block") as u64,
            })
            .collect())
    }
}

#[async_trait]
impl ReplayGuard for SqliteStorage {
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError> {
        Ok(ReplayGuard::get(self, message_id).await?.is_some())
    }

    async fn record(&self, record: ReplayRecord) -> Result<bool, LedgerError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO replay_guard (message_id, processed_at) VALUES (?, ?)")
                .bind(&record.message_id)
                .bind(record.processed_at)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, message_id: &str) -> Result<Option<ReplayRecord>, LedgerError> {
        let row = sqlx::query("SELECT processed_at FROM replay_guard WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| ReplayRecord {
            message_id: message_id.to_string(),
            processed_at: r.get("processed_at"),
        }))
    }
}

#[async_trait]
impl LedgerStore for SqliteStorage {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ChainLedgerEntry>, LedgerError> {
        let row = sqlx::query(
            "SELECT collateral, borrowed, updated_at FROM ledger WHERE chain_id = ? AND account = ?",
        )
        .bind(key.chain_id as i64)
        .bind(&key.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let Some(r) = row else { return Ok(None) };
        Ok(Some(ChainLedgerEntry {
            chain_id: key.chain_id,
            key: key.key.clone(),
            collateral: parse_amount(&r.get::<String, _>("collateral"), "collateral", &key.key)?,
            borrowed: parse_amount(&r.get::<String, _>("borrowed"), "borrowed", &key.key)?,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn put(&self, entry: ChainLedgerEntry) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO ledger (chain_id, account, collateral, borrowed, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(chain_id, account) DO UPDATE SET
                collateral = excluded.collateral,
                borrowed   = excluded.borrowed,
                updated_at = excluded.updated_at",
        )
        .bind(entry.chain_id as i64)
        .bind(&entry.key)
        .bind(entry.collateral.to_string())
        .bind(entry.borrowed.to_string())
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn entries_for(&self, account: &str) -> Result<Vec<ChainLedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT chain_id, collateral, borrowed, updated_at FROM ledger
             WHERE account = ? ORDER BY chain_id",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for r in rows {
            entries.push(ChainLedgerEntry {
                chain_id: r.get::<i64, _>("chain_id") as u64,
                key: account.to_string(),
                collateral: parse_amount(&r.get::<String, _>("collateral"), "collateral", account)?,
                borrowed: parse_amount(&r.get::<String, _>("borrowed"), "borrowed", account)?,
                updated_at: r.get("updated_at"),
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl OutboundStore for SqliteStorage {
    async fn put_outbound(&self, message: &OutboundMessage) -> Result<(), LedgerError> {
        let body = serde_json::to_string(message).map_err(|e| LedgerError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO outbound (message_id, status, body) VALUES (?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE SET
                status = excluded.status,
                body   = excluded.body",
        )
        .bind(&message.message_id)
        .bind(message.status.to_string())
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn remove_outbound(&self, message_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM outbound WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn load_outbound(&self) -> Result<Vec<OutboundMessage>, LedgerError> {
        let rows = sqlx::query("SELECT body FROM outbound ORDER BY message_id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter()
            .map(|r| {
                serde_json::from_str(&r.get::<String, _>("body"))
                    .map_err(|e| LedgerError::Storage(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_upsert() {
        let store = SqliteStorage::in_memory().await.unwrap();
        for block in [100, 250] {
            store
                .save(Checkpoint {
                    chain_id: 1,
                    block_number: block,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }
        let cp = CheckpointStore::load(&store, 1).await.unwrap().unwrap();
        assert_eq!(cp.block_number, 250);
    }

    #[tokio::test]
    async fn registry_and_replay_report_duplicates() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let inst = ContractInstance::new("0xaaa", 1, 100);
        assert!(store.insert(&inst).await.unwrap());
        assert!(!store.insert(&inst).await.unwrap());

        let rec = ReplayRecord {
            message_id: "m".into(),
            processed_at: 3,
        };
        assert!(store.record(rec.clone()).await.unwrap());
        assert!(!store.record(rec).await.unwrap());
        assert!(store.is_processed("m").await.unwrap());
    }

    #[tokio::test]
    async fn ledger_amounts_keep_full_precision() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut entry = ChainLedgerEntry::empty(&LedgerKey::new(137, "alice"));
        entry.collateral = u128::MAX;
        store.put(entry).await.unwrap();
        let all = store.entries_for("alice").await.unwrap();
        assert_eq!(all[0].collateral, u128::MAX);
    }

    #[tokio::test]
    async fn outbound_upsert_and_remove() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut message = OutboundMessage {
            message_id: "m-1".into(),
            source_chain: 1,
            dest_chain: 42161,
            protocol: "ccip".into(),
            recipient: "0x0b".into(),
            payload: vec![1, 2, 3],
            fee: u128::MAX,
            status: chainledger_core::types::MessageStatus::Pending,
            attempt_count: 0,
            next_retry_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            receipt: None,
            sent_at: None,
            last_error: None,
        };
        store.put_outbound(&message).await.unwrap();
        message.attempt_count = 1;
        message.last_error = Some("rpc 502".into());
        store.put_outbound(&message).await.unwrap();

        assert_eq!(store.load_outbound().await.unwrap(), vec![message]);
        store.remove_outbound("m-1").await.unwrap();
        assert!(store.load_outbound().await.unwrap().is_empty());
    }
}
