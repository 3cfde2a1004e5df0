use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::catalog::store::{KvEntry, MetadataStore, TxnOp, WatchEvent};
use crate::error::{AppError, AppResult};

struct Inner {
    entries: HashMap<String, KvEntry>,
    /// Append-only log of every event ever applied, so `watch` can replay
    /// history for a restarting consumer without needing etcd's own
    /// compacted revision history.
    log: Vec<WatchEvent>,
    subscribers: Vec<mpsc::Sender<WatchEvent>>,
}

/// An in-process metadata store used by tests and by any embedder that
/// does not want to stand up etcd. Implements the literal CAS law from
/// spec §8: `put(k, v, compare=V)` succeeds iff the key's current version
/// is exactly `V`, and on success the new version is `V + 1`.
pub struct InMemoryMetadataStore {
    inner: Mutex<Inner>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                log: Vec::new(),
                subscribers: Vec::new(),
            }),
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn event_version(event: &WatchEvent) -> u64 {
    match event {
        WatchEvent::Put(entry) => entry.version,
        WatchEvent::Delete { version, .. } => *version,
    }
}

fn event_key(event: &WatchEvent) -> &str {
    match event {
        WatchEvent::Put(entry) => &entry.key,
        WatchEvent::Delete { key, .. } => key,
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, key: &str) -> AppResult<Option<KvEntry>> {
        let inner = self.inner.lock().expect("metadata store mutex poisoned");
        Ok(inner.entries.get(key).cloned())
    }

    async fn list_prefix(&self, prefix: &str) -> AppResult<Vec<KvEntry>> {
        let inner = self.inner.lock().expect("metadata store mutex poisoned");
        let mut matches: Vec<KvEntry> = inner
            .entries
            .values()
            .filter(|e| e.key.starts_with(prefix))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matches)
    }

    async fn put(&self, key: &str, value: Vec<u8>, compare: Option<u64>) -> AppResult<u64> {
        let mut inner = self.inner.lock().expect("metadata store mutex poisoned");
        let current_version = inner.entries.get(key).map(|e| e.version);

        match (current_version, compare) {
            (None, None) => {}
            (Some(cur), Some(expected)) if cur == expected => {}
            _ => {
                return Err(AppError::Conflict(format!(
                    "compare-and-swap failed for key {key}: expected {compare:?}, found {current_version:?}"
                )))
            }
        }

        let new_version = compare.map(|v| v + 1).unwrap_or(1);
        let entry = KvEntry {
            key: key.to_string(),
            value,
            version: new_version,
        };
        inner.entries.insert(key.to_string(), entry.clone());
        broadcast(&mut inner, WatchEvent::Put(entry));
        Ok(new_version)
    }

    async fn upsert(&self, key: &str, value: Vec<u8>) -> AppResult<u64> {
        let mut inner = self.inner.lock().expect("metadata store mutex poisoned");
        let new_version = inner.entries.get(key).map(|e| e.version + 1).unwrap_or(1);
        let entry = KvEntry {
            key: key.to_string(),
            value,
            version: new_version,
        };
        inner.entries.insert(key.to_string(), entry.clone());
        broadcast(&mut inner, WatchEvent::Put(entry));
        Ok(new_version)
    }

    async fn delete(&self, key: &str, compare: Option<u64>) -> AppResult<()> {
        let mut inner = self.inner.lock().expect("metadata store mutex poisoned");
        let current_version = inner.entries.get(key).map(|e| e.version);

        if let Some(expected) = compare {
            if current_version != Some(expected) {
                return Err(AppError::Conflict(format!(
                    "compare-and-swap failed deleting key {key}: expected {expected}, found {current_version:?}"
                )));
            }
        }

        inner.entries.remove(key);
        let version = compare.map(|v| v + 1).unwrap_or(0);
        broadcast(&mut inner, WatchEvent::Delete {
            key: key.to_string(),
            version,
        });
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> AppResult<()> {
        let mut inner = self.inner.lock().expect("metadata store mutex poisoned");

        // Validate every compare before applying any write, so the
        // transaction is all-or-nothing.
        for op in &ops {
            let (key, compare) = match op {
                TxnOp::Put { key, compare, .. } => (key, *compare),
                TxnOp::Delete { key, compare } => (key, *compare),
            };
            let current_version = inner.entries.get(key).map(|e| e.version);
            match (current_version, compare) {
                (None, None) => {}
                (Some(cur), Some(expected)) if cur == expected => {}
                _ => {
                    return Err(AppError::Conflict(format!(
                        "transaction compare-and-swap failed for key {key}"
                    )))
                }
            }
        }

        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value, compare } => {
                    let new_version = compare.map(|v| v + 1).unwrap_or(1);
                    let entry = KvEntry {
                        key: key.clone(),
                        value,
                        version: new_version,
                    };
                    inner.entries.insert(key, entry.clone());
                    events.push(WatchEvent::Put(entry));
                }
                TxnOp::Delete { key, compare } => {
                    inner.entries.remove(&key);
                    let version = compare.map(|v| v + 1).unwrap_or(0);
                    events.push(WatchEvent::Delete { key, version });
                }
            }
        }

        for event in events {
            broadcast(&mut inner, event);
        }

        Ok(())
    }

    async fn watch(&self, prefix: &str, from_version: u64) -> AppResult<ReceiverStream<WatchEvent>> {
        let (tx, rx) = mpsc::channel(256);

        let mut inner = self.inner.lock().expect("metadata store mutex poisoned");
        for event in inner.log.iter() {
            if event_key(event).starts_with(prefix) && event_version(event) >= from_version {
                let _ = tx.try_send(event.clone());
            }
        }
        inner.subscribers.push(tx);

        Ok(ReceiverStream::new(rx))
    }
}

fn broadcast(inner: &mut Inner, event: WatchEvent) {
    inner.log.push(event.clone());
    inner.subscribers.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_succeeds_iff_compare_matches_current_version() {
        let store = InMemoryMetadataStore::new();
        let v1 = store.put("/k", b"a".to_vec(), None).await.unwrap();
        assert_eq!(v1, 1);

        let v2 = store.put("/k", b"b".to_vec(), Some(v1)).await.unwrap();
        assert_eq!(v2, v1 + 1);

        let err = store.put("/k", b"c".to_vec(), Some(v1)).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn upsert_overwrites_without_a_compare_check() {
        let store = InMemoryMetadataStore::new();
        let v1 = store.upsert("/job/1", b"pending".to_vec()).await.unwrap();
        assert_eq!(v1, 1);
        let v2 = store.upsert("/job/1", b"running".to_vec()).await.unwrap();
        assert_eq!(v2, 2);
        let entry = store.get("/job/1").await.unwrap().unwrap();
        assert_eq!(entry.value, b"running".to_vec());
    }

    #[tokio::test]
    async fn txn_is_all_or_nothing() {
        let store = InMemoryMetadataStore::new();
        store.put("/a", b"1".to_vec(), None).await.unwrap();

        let result = store
            .txn(vec![
                TxnOp::Put {
                    key: "/a".to_string(),
                    value: b"2".to_vec(),
                    compare: Some(1),
                },
                TxnOp::Put {
                    key: "/b".to_string(),
                    value: b"x".to_vec(),
                    compare: Some(99), // wrong: /b does not exist yet
                },
            ])
            .await;

        assert!(result.is_err());
        // /a must be untouched since the transaction aborted.
        let entry = store.get("/a").await.unwrap().unwrap();
        assert_eq!(entry.value, b"1".to_vec());
    }

    #[tokio::test]
    async fn watch_replays_buffered_events_from_version() {
        let store = InMemoryMetadataStore::new();
        store.put("/catalog/shards/x", b"v1".to_vec(), None).await.unwrap();
        store
            .put("/catalog/shards/x", b"v2".to_vec(), Some(1))
            .await
            .unwrap();

        let mut stream = store.watch("/catalog/", 2).await.unwrap();
        use tokio_stream::StreamExt;
        let event = stream.next().await.unwrap();
        assert_eq!(event_version(&event), 2);
    }
}
