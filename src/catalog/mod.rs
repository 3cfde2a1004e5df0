//! The versioned metadata catalog (spec §3/§4.2): shards, client-app
//! bindings, and a monotonic catalog version, persisted through a
//! `MetadataStore` and observable through `watch`.

pub mod etcd_store;
pub mod memory_store;
pub mod model;
pub mod store;

use std::sync::Arc;

use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::error::{AppError, AppResult};
use model::{ClientAppBinding, CatalogSnapshot, Shard, ShardId, ShardStatus};
use store::{KvEntry, MetadataStore, TxnOp, WatchEvent};

const SHARD_PREFIX: &str = "/catalog/shards/";
const BINDING_PREFIX: &str = "/catalog/bindings/";
const VERSION_KEY: &str = "/catalog/version";

fn shard_key(id: ShardId) -> String {
    format!("{SHARD_PREFIX}{id}")
}

fn binding_key(app_id: &str, shard_id: ShardId) -> String {
    format!("{BINDING_PREFIX}{app_id}/{shard_id}")
}

/// The catalog's view of the current metadata store contents, plus the
/// version of `/catalog/version` that was read alongside it. Every
/// mutation bumps `/catalog/version` inside the same transaction as the
/// data change, so a consumer that tracks this number never observes a
/// torn update (spec §4.2).
pub struct Catalog {
    store: Arc<dyn MetadataStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Gives other subsystems (resharder job records, health monitor
    /// state) access to the same underlying store, so every durable
    /// record lives behind one linearizable KV rather than a second
    /// bespoke store.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    async fn current_version(&self) -> AppResult<u64> {
        Ok(self
            .store
            .get(VERSION_KEY)
            .await?
            .map(|e| decode_version(&e.value))
            .unwrap_or(0))
    }

    /// Reads every shard and binding currently on record, labeled with the
    /// catalog version observed alongside them.
    pub async fn snapshot(&self) -> AppResult<CatalogSnapshot> {
        let version = self.current_version().await?;

        let shard_entries = self.store.list_prefix(SHARD_PREFIX).await?;
        let mut shards = Vec::with_capacity(shard_entries.len());
        for entry in shard_entries {
            shards.push(decode_shard(&entry)?);
        }

        let binding_entries = self.store.list_prefix(BINDING_PREFIX).await?;
        let mut bindings = Vec::with_capacity(binding_entries.len());
        for entry in binding_entries {
            bindings.push(decode_binding(&entry)?);
        }

        Ok(CatalogSnapshot {
            version,
            shards,
            bindings,
        })
    }

    pub async fn get_shard(&self, id: ShardId) -> AppResult<Option<Shard>> {
        match self.store.get(&shard_key(id)).await? {
            Some(entry) => Ok(Some(decode_shard(&entry)?)),
            None => Ok(None),
        }
    }

    /// Creates a new shard record and bumps the catalog version atomically.
    pub async fn create_shard(&self, shard: Shard) -> AppResult<Shard> {
        shard.validate()?;

        let version_entry = self.store.get(VERSION_KEY).await?;
        let version_compare = version_entry.as_ref().map(|e| e.version);
        let next_version = version_entry
            .map(|e| decode_version(&e.value))
            .unwrap_or(0)
            + 1;

        self.store
            .txn(vec![
                TxnOp::Put {
                    key: shard_key(shard.id),
                    value: encode_shard(&shard)?,
                    compare: None,
                },
                TxnOp::Put {
                    key: VERSION_KEY.to_string(),
                    value: encode_version(next_version),
                    compare: version_compare,
                },
            ])
            .await?;

        Ok(shard)
    }

    /// Applies `mutate` to the current shard record and persists it with a
    /// compare-and-swap against the version last read, retrying the whole
    /// read-modify-write if another writer raced it. This is the only path
    /// by which a shard's status, urls, or vnode count change (spec §4.2).
    pub async fn update_shard<F>(&self, id: ShardId, mutate: F) -> AppResult<Shard>
    where
        F: Fn(&mut Shard) -> AppResult<()> + Send,
    {
        crate::util::retry::retry_with_backoff(
            5,
            std::time::Duration::from_millis(20),
            std::time::Duration::from_millis(500),
            |_attempt| async {
                let entry = self
                    .store
                    .get(&shard_key(id))
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("shard {id}")))?;
                let mut shard = decode_shard(&entry)?;
                mutate(&mut shard)?;
                shard.validate()?;

                let version_entry = self.store.get(VERSION_KEY).await?;
                let next_version = version_entry
                    .as_ref()
                    .map(|e| decode_version(&e.value))
                    .unwrap_or(0)
                    + 1;

                self.store
                    .txn(vec![
                        TxnOp::Put {
                            key: shard_key(id),
                            value: encode_shard(&shard)?,
                            compare: Some(entry.version),
                        },
                        TxnOp::Put {
                            key: VERSION_KEY.to_string(),
                            value: encode_version(next_version),
                            compare: version_entry.map(|e| e.version),
                        },
                    ])
                    .await?;

                Ok(shard)
            },
        )
        .await
    }

    /// Deletes a shard record. Callers are expected to have already
    /// transitioned the shard to `Inactive`; this does not check status
    /// itself since the resharder is the only caller and already enforces
    /// the ordering.
    pub async fn delete_shard(&self, id: ShardId) -> AppResult<()> {
        let entry = self
            .store
            .get(&shard_key(id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("shard {id}")))?;

        let version_entry = self.store.get(VERSION_KEY).await?;
        let next_version = version_entry
            .as_ref()
            .map(|e| decode_version(&e.value))
            .unwrap_or(0)
            + 1;

        self.store
            .txn(vec![
                TxnOp::Delete {
                    key: shard_key(id),
                    compare: Some(entry.version),
                },
                TxnOp::Put {
                    key: VERSION_KEY.to_string(),
                    value: encode_version(next_version),
                    compare: version_entry.map(|e| e.version),
                },
            ])
            .await
    }

    pub async fn bind_app(&self, binding: ClientAppBinding) -> AppResult<()> {
        let key = binding_key(&binding.app_id, binding.shard_id);
        let value = serde_json::to_vec(&binding)
            .map_err(|e| AppError::Internal(format!("encoding binding: {e}")))?;
        self.store.put(&key, value, None).await?;
        Ok(())
    }

    /// Streams coherent snapshots: an initial one built from the current
    /// state, then a new one every time `/catalog/*` changes. Consumers
    /// (the router's ring reconciler, health monitor) never see a partial
    /// update (spec §4.2, §5).
    pub async fn watch(&self) -> AppResult<impl futures::Stream<Item = AppResult<CatalogSnapshot>> + '_> {
        let initial = self.snapshot().await?;
        let from_version = initial.version;
        let raw: ReceiverStream<WatchEvent> = self.store.watch("/catalog/", from_version).await?;

        let stream = futures::stream::once(async move { Ok(initial) }).chain(
            raw.then(move |_event| async move { self.snapshot().await }),
        );

        Ok(stream)
    }

    /// Shards actively owning hash space right now (excludes `Inactive`).
    pub async fn active_shards(&self) -> AppResult<Vec<Shard>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .shards
            .into_iter()
            .filter(|s| s.status != ShardStatus::Inactive)
            .collect())
    }
}

fn encode_shard(shard: &Shard) -> AppResult<Vec<u8>> {
    serde_json::to_vec(shard).map_err(|e| AppError::Internal(format!("encoding shard: {e}")))
}

fn decode_shard(entry: &KvEntry) -> AppResult<Shard> {
    let mut shard: Shard = serde_json::from_slice(&entry.value)
        .map_err(|e| AppError::Internal(format!("decoding shard: {e}")))?;
    shard.version = entry.version;
    Ok(shard)
}

fn decode_binding(entry: &KvEntry) -> AppResult<ClientAppBinding> {
    serde_json::from_slice(&entry.value)
        .map_err(|e| AppError::Internal(format!("decoding binding: {e}")))
}

fn encode_version(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

fn decode_version(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_store::InMemoryMetadataStore;

    fn shard(name: &str) -> Shard {
        Shard::new(name.to_string(), format!("db://{name}/primary"), vec![], 256)
    }

    #[tokio::test]
    async fn create_shard_bumps_catalog_version() {
        let catalog = Catalog::new(Arc::new(InMemoryMetadataStore::new()));
        let before = catalog.snapshot().await.unwrap().version;
        catalog.create_shard(shard("a")).await.unwrap();
        let after = catalog.snapshot().await.unwrap().version;
        assert!(after > before);
    }

    #[tokio::test]
    async fn update_shard_rejects_illegal_transition() {
        let catalog = Catalog::new(Arc::new(InMemoryMetadataStore::new()));
        let s = catalog.create_shard(shard("a")).await.unwrap();
        let result = catalog
            .update_shard(s.id, |shard| shard.transition(ShardStatus::Inactive))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delete_shard_removes_it_from_snapshot() {
        let catalog = Catalog::new(Arc::new(InMemoryMetadataStore::new()));
        let s = catalog.create_shard(shard("a")).await.unwrap();
        catalog.delete_shard(s.id).await.unwrap();
        let snapshot = catalog.snapshot().await.unwrap();
        assert!(snapshot.shard(s.id).is_none());
    }

    #[tokio::test]
    async fn active_shards_excludes_inactive() {
        let catalog = Catalog::new(Arc::new(InMemoryMetadataStore::new()));
        let s = catalog.create_shard(shard("a")).await.unwrap();
        catalog
            .update_shard(s.id, |shard| shard.transition(ShardStatus::Readonly))
            .await
            .unwrap();
        catalog
            .update_shard(s.id, |shard| shard.transition(ShardStatus::Inactive))
            .await
            .unwrap();
        let active = catalog.active_shards().await.unwrap();
        assert!(active.is_empty());
    }
}
