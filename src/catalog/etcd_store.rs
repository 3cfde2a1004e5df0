//! etcd-backed `MetadataStore`. Grounded in the etcd client usage shown by
//! `ClusterImpl` in the cluster example (`Client::connect`, txn/compare,
//! watch streams), adapted from ceresdb's shard-lock bookkeeping to this
//! crate's catalog KV layout.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp as EtcdTxnOp,
    WatchOptions,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::catalog::store::{KvEntry, MetadataStore, TxnOp, WatchEvent};
use crate::config::MetadataStoreConfig;
use crate::error::{AppError, AppResult};

/// Talks to a real etcd cluster. Version tokens returned to callers are
/// etcd's own per-key `mod_revision`: monotonically increasing and
/// CAS-comparable, though not contiguous `+1` like the in-memory store's
/// version counter. Both satisfy the only invariant the rest of the crate
/// depends on — "the version observed is the version that must still hold
/// for the write to land" — so the two stores remain interchangeable
/// (see DESIGN.md).
pub struct EtcdMetadataStore {
    client: Client,
}

impl EtcdMetadataStore {
    pub async fn connect(config: &MetadataStoreConfig) -> AppResult<Self> {
        let mut options = ConnectOptions::new().with_timeout(config.request_timeout());
        if let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) {
            let cert_pem = tokio::fs::read_to_string(cert)
                .await
                .map_err(|e| AppError::CatalogUnavailable(format!("reading tls cert: {e}")))?;
            let key_pem = tokio::fs::read_to_string(key)
                .await
                .map_err(|e| AppError::CatalogUnavailable(format!("reading tls key: {e}")))?;
            let mut tls = etcd_client::TlsOptions::new().identity(etcd_client::Identity::from_pem(cert_pem, key_pem));
            if let Some(ca) = &config.tls_ca_path {
                let ca_pem = tokio::fs::read_to_string(ca)
                    .await
                    .map_err(|e| AppError::CatalogUnavailable(format!("reading tls ca: {e}")))?;
                tls = tls.ca_certificate(etcd_client::Certificate::from_pem(ca_pem));
            }
            options = options.with_tls(tls);
        }

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| AppError::CatalogUnavailable(format!("connecting to metadata store: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MetadataStore for EtcdMetadataStore {
    async fn get(&self, key: &str) -> AppResult<Option<KvEntry>> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KvEntry {
            key: key.to_string(),
            value: kv.value().to_vec(),
            version: kv.mod_revision() as u64,
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> AppResult<Vec<KvEntry>> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| KvEntry {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                version: kv.mod_revision() as u64,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>, compare: Option<u64>) -> AppResult<u64> {
        let mut kv = self.client.kv_client();
        let cmp = match compare {
            Some(version) => Compare::mod_revision(key, CompareOp::Equal, version as i64),
            None => Compare::create_revision(key, CompareOp::Equal, 0),
        };
        let txn = Txn::new()
            .when([cmp])
            .and_then([EtcdTxnOp::put(key, value, Some(PutOptions::new()))]);

        let resp = kv.txn(txn).await?;
        if !resp.succeeded() {
            return Err(AppError::Conflict(format!(
                "compare-and-swap failed for key {key}"
            )));
        }

        // Re-read to learn the revision the write actually landed at.
        let entry = self.get(key).await?.ok_or_else(|| {
            AppError::Internal(format!("key {key} missing immediately after put"))
        })?;
        Ok(entry.version)
    }

    async fn upsert(&self, key: &str, value: Vec<u8>) -> AppResult<u64> {
        let mut kv = self.client.kv_client();
        kv.put(key, value, Some(PutOptions::new())).await?;

        let entry = self.get(key).await?.ok_or_else(|| {
            AppError::Internal(format!("key {key} missing immediately after put"))
        })?;
        Ok(entry.version)
    }

    async fn delete(&self, key: &str, compare: Option<u64>) -> AppResult<()> {
        let mut kv = self.client.kv_client();
        let cmp = match compare {
            Some(version) => Compare::mod_revision(key, CompareOp::Equal, version as i64),
            None => Compare::create_revision(key, CompareOp::Greater, 0),
        };
        let txn = Txn::new()
            .when([cmp])
            .and_then([EtcdTxnOp::delete(key, None)]);

        let resp = kv.txn(txn).await?;
        if !resp.succeeded() {
            return Err(AppError::Conflict(format!(
                "compare-and-swap failed deleting key {key}"
            )));
        }
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> AppResult<()> {
        let mut kv = self.client.kv_client();

        let mut compares = Vec::with_capacity(ops.len());
        let mut writes = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value, compare } => {
                    compares.push(match compare {
                        Some(version) => Compare::mod_revision(key.clone(), CompareOp::Equal, version as i64),
                        None => Compare::create_revision(key.clone(), CompareOp::Equal, 0),
                    });
                    writes.push(EtcdTxnOp::put(key, value, Some(PutOptions::new())));
                }
                TxnOp::Delete { key, compare } => {
                    compares.push(match compare {
                        Some(version) => Compare::mod_revision(key.clone(), CompareOp::Equal, version as i64),
                        None => Compare::create_revision(key.clone(), CompareOp::Greater, 0),
                    });
                    writes.push(EtcdTxnOp::delete(key, None));
                }
            }
        }

        let txn = Txn::new().when(compares).and_then(writes);
        let resp = kv.txn(txn).await?;
        if !resp.succeeded() {
            return Err(AppError::Conflict(
                "transaction compare-and-swap failed".to_string(),
            ));
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, from_version: u64) -> AppResult<ReceiverStream<WatchEvent>> {
        let (tx, rx) = mpsc::channel(256);

        // Replay anything at or after `from_version` before switching to
        // etcd's own watch, the same at-least-once contract the in-memory
        // store provides.
        for entry in self.list_prefix(prefix).await? {
            if entry.version >= from_version {
                let _ = tx.try_send(WatchEvent::Put(entry));
            }
        }

        let mut watch_client = self.client.watch_client();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_version as i64);
        let (_watcher, mut stream) = watch_client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| AppError::CatalogUnavailable(format!("starting watch: {e}")))?;

        tokio::spawn(async move {
            // `_watcher` must stay alive for the stream to keep producing
            // events; moving it into this task ties its lifetime to the
            // consumer's channel.
            let _watcher = _watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    let mapped = match event.event_type() {
                        etcd_client::EventType::Put => WatchEvent::Put(KvEntry {
                            key,
                            value: kv.value().to_vec(),
                            version: kv.mod_revision() as u64,
                        }),
                        etcd_client::EventType::Delete => WatchEvent::Delete {
                            key,
                            version: kv.mod_revision() as u64,
                        },
                    };
                    if tx.send(mapped).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
