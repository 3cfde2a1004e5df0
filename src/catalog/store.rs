use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::AppResult;

/// One versioned key/value entry as read back from the metadata store.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// An event delivered by `MetadataStore::watch` (spec §6: `Watch(prefix,
/// from-version)` returns a stream of `(key, new-value, version)`).
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KvEntry),
    Delete { key: String, version: u64 },
}

/// One step of a multi-key transaction (spec §6: `Txn(ops)`).
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        compare: Option<u64>,
    },
    Delete {
        key: String,
        compare: Option<u64>,
    },
}

/// The linearizable key-value store with watch that the core assumes
/// (spec §1/§6): etcd semantics. `compare` is always a version token the
/// caller last observed for that key; `None` asserts the key does not yet
/// exist. On a CAS mismatch, implementations return `AppError::Conflict`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<KvEntry>>;

    async fn list_prefix(&self, prefix: &str) -> AppResult<Vec<KvEntry>>;

    /// Returns the new version on success.
    async fn put(&self, key: &str, value: Vec<u8>, compare: Option<u64>) -> AppResult<u64>;

    /// Writes `key` unconditionally, whether or not it already exists.
    /// For state that is written once and then repeatedly overwritten by
    /// its sole owner (reshard job progress, health probe snapshots) where
    /// no other writer could ever race the update, so there is nothing to
    /// compare-and-swap against.
    async fn upsert(&self, key: &str, value: Vec<u8>) -> AppResult<u64>;

    async fn delete(&self, key: &str, compare: Option<u64>) -> AppResult<()>;

    /// All-or-nothing: every `compare` is checked before any write lands.
    async fn txn(&self, ops: Vec<TxnOp>) -> AppResult<()>;

    /// A restartable stream of watch events for keys under `prefix`,
    /// replaying anything the store buffered at or after `from_version`
    /// before switching to live delivery (at-least-once, spec §4.2).
    async fn watch(&self, prefix: &str, from_version: u64) -> AppResult<ReceiverStream<WatchEvent>>;
}
