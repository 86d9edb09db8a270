//! File snapshot storage backend.
//!
//! Each concern lives in its own JSON snapshot under one directory:
//!
//! ```text
//! <dir>/checkpoints.json    chain_id → Checkpoint
//! <dir>/registry.json       [ContractInstance]
//! <dir>/replay_guard.json   message_id → ReplayRecord
//! <dir>/ledger.json         [ChainLedgerEntry]
//! <dir>/outbound.json       message_id → OutboundMessage (unconfirmed only)
//! ```
//!
//! Every mutation rewrites the whole snapshot through a temp file, `fsync`,
//! `rename` and a directory `fsync`. A crash leaves either the old or the new
//! snapshot, never a torn one. The in-memory copy is only updated after the
//! write succeeds, so a failed write leaves both sides unchanged.
//!
//! `replay_guard.json` grows by one record per applied inbound message and is
//! rewritten whole on each `record`. Nodes with sustained inbound traffic
//! should use the SQLite backend, which inserts one row per message.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use chainledger_core::checkpoint::{Checkpoint, CheckpointStore};
use chainledger_core::error::LedgerError;
use chainledger_core::registry::RegistryStore;
use chainledger_core::state::{LedgerStore, OutboundStore, ReplayGuard};
use chainledger_core::types::{
    ChainId, ChainLedgerEntry, ContractInstance, LedgerKey, OutboundMessage, ReplayRecord,
};

const CHECKPOINTS_FILE: &str = "checkpoints.json";
const REGISTRY_FILE: &str = "registry.json";
const REPLAY_FILE: &str = "replay_guard.json";
const LEDGER_FILE: &str = "ledger.json";
const OUTBOUND_FILE: &str = "outbound.json";

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("snapshot io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot json error at {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot writer task failed: {0}")]
    Join(String),
}

impl From<FileStoreError> for LedgerError {
    fn from(e: FileStoreError) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// Durable storage over JSON snapshots in a directory.
pub struct FileStorage {
    dir: PathBuf,
    checkpoints: Mutex<BTreeMap<ChainId, Checkpoint>>,
    registry: Mutex<Vec<ContractInstance>>,
    replay: Mutex<BTreeMap<String, ReplayRecord>>,
    ledger: Mutex<BTreeMap<LedgerKey, ChainLedgerEntry>>,
    outbound: Mutex<BTreeMap<String, OutboundMessage>>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory and load its snapshots.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        let loaded = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || load_all(&dir))
                .await
                .map_err(|e| FileStoreError::Join(e.to_string()))??
        };
        let (checkpoints, registry, replay, ledger, outbound) = loaded;
        info!(
            dir = %dir.display(),
            checkpoints = checkpoints.len(),
            instances = registry.len(),
            replay = replay.len(),
            outbound = outbound.len(),
            "Opened file storage"
        );
        Ok(Self {
            dir,
            checkpoints: Mutex::new(checkpoints),
            registry: Mutex::new(registry),
            replay: Mutex::new(replay),
            ledger: Mutex::new(
                ledger
                    .into_iter()
                    .map(|e: ChainLedgerEntry| (e.ledger_key(), e))
                    .collect(),
            ),
            outbound: Mutex::new(outbound),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist<T>(&self, file: &'static str, value: &T) -> Result<(), LedgerError>
    where
        T: Serialize,
    {
        let path = self.dir.join(file);
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| FileStoreError::Json {
            path: path.clone(),
            source,
        })?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| FileStoreError::Join(e.to_string()))??;
        debug!(file, "Snapshot written");
        Ok(())
    }

    async fn reload<T>(&self, file: &'static str) -> Result<T, LedgerError>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        let path = self.dir.join(file);
        let value = tokio::task::spawn_blocking(move || read_json_or_default(&path))
            .await
            .map_err(|e| FileStoreError::Join(e.to_string()))??;
        Ok(value)
    }
}

type Loaded = (
    BTreeMap<ChainId, Checkpoint>,
    Vec<ContractInstance>,
    BTreeMap<String, ReplayRecord>,
    Vec<ChainLedgerEntry>,
    BTreeMap<String, OutboundMessage>,
);

fn load_all(dir: &Path) -> Result<Loaded, FileStoreError> {
    fs::create_dir_all(dir).map_err(|source| io_err(dir, source))?;
    Ok((
        read_json_or_default(&dir.join(CHECKPOINTS_FILE))?,
        read_json_or_default(&dir.join(REGISTRY_FILE))?,
        read_json_or_default(&dir.join(REPLAY_FILE))?,
        read_json_or_default(&dir.join(LEDGER_FILE))?,
        read_json_or_default(&dir.join(OUTBOUND_FILE))?,
    ))
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, FileStoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => return Err(io_err(path, source)),
    };
    serde_json::from_slice(&bytes).map_err(|source| FileStoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FileStoreError> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path).map_err(|source| io_err(&tmp_path, source))?;
    file.write_all(bytes)
        .map_err(|source| io_err(&tmp_path, source))?;
    file.sync_all().map_err(|source| io_err(&tmp_path, source))?;

    fs::rename(&tmp_path, path).map_err(|source| io_err(path, source))?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> FileStoreError {
    FileStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> Result<(), FileStoreError> {
    let dir = File::open(path).map_err(|source| io_err(path, source))?;
    dir.sync_all().map_err(|source| io_err(path, source))?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> Result<(), FileStoreError> {
    Ok(())
}

// ─── Trait impls ──────────────────────────────────────────────────────────────

// Checkpoints are re-read from disk on every access: the operator CLI edits
// them from another process while a node is running.
#[async_trait]
impl CheckpointStore for FileStorage {
    async fn load(&self, chain_id: ChainId) -> Result<Option<Checkpoint>, LedgerError> {
        let mut current = self.checkpoints.lock().await;
        *current = self.reload(CHECKPOINTS_FILE).await?;
        Ok(current.get(&chain_id).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), LedgerError> {
        let mut current = self.checkpoints.lock().await;
        let mut next: BTreeMap<ChainId, Checkpoint> = self.reload(CHECKPOINTS_FILE).await?;
        next.insert(checkpoint.chain_id, checkpoint);
        self.persist(CHECKPOINTS_FILE, &next).await?;
        *current = next;
        Ok(())
    }

    async fn delete(&self, chain_id: ChainId) -> Result<(), LedgerError> {
        let mut current = self.checkpoints.lock().await;
        let mut next: BTreeMap<ChainId, Checkpoint> = self.reload(CHECKPOINTS_FILE).await?;
        if next.remove(&chain_id).is_some() {
            self.persist(CHECKPOINTS_FILE, &next).await?;
        }
        *current = next;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for FileStorage {
    async fn insert(&self, instance: &ContractInstance) -> Result<bool, LedgerError> {
        let mut current = self.registry.lock().await;
        if current
            .iter()
            .any(|i| i.chain_id == instance.chain_id && i.address == instance.address)
        {
            return Ok(false);
        }
        let mut next = current.clone();
        next.push(instance.clone());
        self.persist(REGISTRY_FILE, &next).await?;
        *current = next;
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<ContractInstance>, LedgerError> {
        Ok(self.registry.lock().await.clone())
    }
}

#[async_trait]
impl ReplayGuard for FileStorage {
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError> {
        Ok(self.replay.lock().await.contains_key(message_id))
    }

    async fn record(&self, record: ReplayRecord) -> Result<bool, LedgerError> {
        let mut current = self.replay.lock().await;
        if current.contains_key(&record.message_id) {
            return Ok(false);
        }
        let mut next = current.clone();
        next.insert(record.message_id.clone(), record);
        self.persist(REPLAY_FILE, &next).await?;
        *current = next;
        Ok(true)
    }

    async fn get(&self, message_id: &str) -> Result<Option<ReplayRecord>, LedgerError> {
        Ok(self.replay.lock().await.get(message_id).cloned())
    }
}

#[async_trait]
impl LedgerStore for FileStorage {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ChainLedgerEntry>, LedgerError> {
        Ok(self.ledger.lock().await.get(key).cloned())
    }

    async fn put(&self, entry: ChainLedgerEntry) -> Result<(), LedgerError> {
        let mut current = self.ledger.lock().await;
        let mut next = current.clone();
        next.insert(entry.ledger_key(), entry);
        let snapshot: Vec<&ChainLedgerEntry> = next.values().collect();
        self.persist(LEDGER_FILE, &snapshot).await?;
        *current = next;
        Ok(())
    }

    async fn entries_for(&self, account: &str) -> Result<Vec<ChainLedgerEntry>, LedgerError> {
        Ok(self
            .ledger
            .lock()
            .await
            .values()
            .filter(|e| e.key == account)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboundStore for FileStorage {
    async fn put_outbound(&self, message: &OutboundMessage) -> Result<(), LedgerError> {
        let mut current = self.outbound.lock().await;
        let mut next = current.clone();
        next.insert(message.message_id.clone(), message.clone());
        self.persist(OUTBOUND_FILE, &next).await?;
        *current = next;
        Ok(())
    }

    async fn remove_outbound(&self, message_id: &str) -> Result<(), LedgerError> {
        let mut current = self.outbound.lock().await;
        if !current.contains_key(message_id) {
            return Ok(());
        }
        let mut next = current.clone();
        next.remove(message_id);
        self.persist(OUTBOUND_FILE, &next).await?;
        *current = next;
        Ok(())
    }

    async fn load_outbound(&self) -> Result<Vec<OutboundMessage>, LedgerError> {
        Ok(self.outbound.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn snapshots_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStorage::open(tmp.path()).await.unwrap();
            store
                .save(Checkpoint {
                    chain_id: 1,
                    block_number: 110,
                    updated_at: 0,
                })
                .await
                .unwrap();
            store.insert(&ContractInstance::new("0xAAA", 1, 100)).await.unwrap();
            store
                .record(ReplayRecord {
                    message_id: "m-1".into(),
                    processed_at: 7,
                })
                .await
                .unwrap();
            let mut entry = ChainLedgerEntry::empty(&LedgerKey::new(10, "alice"));
            entry.collateral = u128::from(u64::MAX) * 4;
            store.put(entry).await.unwrap();
        }

        let store = FileStorage::open(tmp.path()).await.unwrap();
        let cp = CheckpointStore::load(&store, 1).await.unwrap().unwrap();
        assert_eq!(cp.block_number, 110);
        assert_eq!(store.load_all().await.unwrap()[0].address, "0xaaa");
        assert!(store.is_processed("m-1").await.unwrap());
        let entry = LedgerStore::get(&store, &LedgerKey::new(10, "alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.collateral, u128::from(u64::MAX) * 4);
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::open(tmp.path()).await.unwrap();
        for block in [10, 20, 30] {
            store
                .save(Checkpoint {
                    chain_id: 5,
                    block_number: block,
                    updated_at: 0,
                })
                .await
                .unwrap();
        }
        let names: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![CHECKPOINTS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CHECKPOINTS_FILE), b"{not json").unwrap();
        let err = FileStorage::open(tmp.path()).await.err().unwrap();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    fn checkpoint(chain_id: ChainId, block_number: u64) -> Checkpoint {
        Checkpoint {
            chain_id,
            block_number,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn checkpoint_edits_from_another_handle_are_visible() {
        let tmp = TempDir::new().unwrap();
        let node = FileStorage::open(tmp.path()).await.unwrap();
        node.save(checkpoint(1, 110)).await.unwrap();

        // Operator CLI opens the same directory and rewinds chain 1.
        let cli = FileStorage::open(tmp.path()).await.unwrap();
        cli.save(checkpoint(1, 50)).await.unwrap();
        assert_eq!(CheckpointStore::load(&node, 1).await.unwrap().unwrap().block_number, 50);

        // The node's next write keeps the operator's other edits.
        cli.save(checkpoint(7, 900)).await.unwrap();
        node.save(checkpoint(1, 60)).await.unwrap();
        let reopened = FileStorage::open(tmp.path()).await.unwrap();
        assert_eq!(CheckpointStore::load(&reopened, 7).await.unwrap().unwrap().block_number, 900);
        assert_eq!(CheckpointStore::load(&reopened, 1).await.unwrap().unwrap().block_number, 60);
    }

    fn outbound(id: &str) -> OutboundMessage {
        OutboundMessage {
            message_id: id.into(),
            source_chain: 1,
            dest_chain: 10,
            protocol: "layerzero".into(),
            recipient: "0x0b".into(),
            payload: b"sync".to_vec(),
            fee: u128::from(u64::MAX) + 1,
            status: chainledger_core::types::MessageStatus::Sent,
            attempt_count: 2,
            next_retry_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            receipt: Some("lz-7".into()),
            sent_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn outbound_messages_survive_reopen_until_removed() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStorage::open(tmp.path()).await.unwrap();
            store.put_outbound(&outbound("m-1")).await.unwrap();
            store.put_outbound(&outbound("m-2")).await.unwrap();
            store.remove_outbound("m-1").await.unwrap();
            store.remove_outbound("unknown").await.unwrap();
        }
        let store = FileStorage::open(tmp.path()).await.unwrap();
        let loaded = store.load_outbound().await.unwrap();
        assert_eq!(loaded, vec![outbound("m-2")]);
    }

    #[tokio::test]
    async fn duplicate_registration_not_rewritten() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::open(tmp.path()).await.unwrap();
        assert!(store.insert(&ContractInstance::new("0xaaa", 1, 100)).await.unwrap());
        assert!(!store.insert(&ContractInstance::new("0xaaa", 1, 150)).await.unwrap());
        assert_eq!(store.load_all().await.unwrap()[0].discovered_at_block, 100);
    }
}
