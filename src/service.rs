//! Top-level service handle tying the ring, catalog, router, resharder,
//! health monitor, and auto-scale detector together. Grounded in the
//! teacher's `AppState` (`app_state.rs`): one struct built once at
//! startup, cloned cheaply (every field is an `Arc`), and handed to both
//! the HTTP layer and any embedder that talks to this crate directly.

use std::sync::Arc;

use serde_json::Value;

use crate::autoscale::{AutoScaleDetector, NullMetricsSource, ShardMetricsSource};
use crate::catalog::etcd_store::EtcdMetadataStore;
use crate::catalog::memory_store::InMemoryMetadataStore;
use crate::catalog::model::{Shard, ShardId};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::health::HealthMonitor;
use crate::resharder::model::{JobId, ReshardJob};
use crate::resharder::Resharder;
use crate::ring::HashRange;
use crate::router::{QueryOutcome, Router};

/// Bound enforced on any request/response body the control API accepts
/// or returns (spec §7): 10 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct ShardingService {
    pub catalog: Arc<Catalog>,
    pub router: Arc<Router>,
    pub resharder: Arc<Resharder>,
    pub health: Arc<HealthMonitor>,
    pub autoscale: Arc<AutoScaleDetector>,
    pub config: Config,
}

impl ShardingService {
    /// Connects to the configured etcd endpoints for the metadata store.
    /// This is the path `main.rs` uses.
    pub async fn new(config: Config) -> AppResult<Self> {
        let store = Arc::new(EtcdMetadataStore::connect(&config.metadata_store).await?);
        Self::with_store(config, store, Arc::new(NullMetricsSource)).await
    }

    /// Runs entirely in-process against an in-memory metadata store —
    /// used by integration tests and by any embedder that does not need
    /// etcd's durability (spec §9 note: the in-memory store satisfies the
    /// same CAS law as etcd, just without crash-persistence).
    pub async fn in_memory(config: Config) -> AppResult<Self> {
        let store = Arc::new(InMemoryMetadataStore::new());
        Self::with_store(config, store, Arc::new(NullMetricsSource)).await
    }

    pub async fn with_store(
        config: Config,
        store: Arc<dyn crate::catalog::store::MetadataStore>,
        metrics: Arc<dyn ShardMetricsSource>,
    ) -> AppResult<Self> {
        let catalog = Arc::new(Catalog::new(store));
        let router = Arc::new(Router::new(catalog.clone(), config.router.clone()).await?);
        router.clone().spawn_reconciler().await;

        let resharder = Arc::new(Resharder::new(catalog.clone(), router.clone(), config.resharder.clone()));

        let health = Arc::new(HealthMonitor::new(catalog.clone(), router.clone(), config.health.clone()));
        health.clone().spawn().await;

        let autoscale = Arc::new(AutoScaleDetector::new(
            catalog.clone(),
            health.clone(),
            metrics,
            config.autoscale.clone(),
        ));
        autoscale.clone().spawn().await;

        Ok(Self {
            catalog,
            router,
            resharder,
            health,
            autoscale,
            config,
        })
    }

    /// Request/response size guard for non-HTTP embedders (the axum
    /// layer enforces the same bound via `DefaultBodyLimit`; this lets a
    /// direct caller of `ShardingService` get the identical rejection).
    pub fn check_payload_size(bytes: &[u8]) -> AppResult<()> {
        if bytes.len() > MAX_PAYLOAD_BYTES {
            return Err(AppError::PayloadTooLarge);
        }
        Ok(())
    }

    pub async fn create_shard(&self, shard: Shard) -> AppResult<Shard> {
        self.catalog.create_shard(shard).await
    }

    pub async fn get_shard(&self, id: ShardId) -> AppResult<Shard> {
        self.catalog
            .get_shard(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("shard {id}")))
    }

    pub async fn list_shards(&self) -> AppResult<Vec<Shard>> {
        Ok(self.catalog.snapshot().await?.shards)
    }

    pub async fn delete_shard(&self, id: ShardId) -> AppResult<()> {
        self.catalog.delete_shard(id).await
    }

    pub async fn split_shard(
        &self,
        source: ShardId,
        target: ShardId,
        table_name: String,
        range: HashRange,
    ) -> AppResult<ReshardJob> {
        self.resharder.start_split(source, target, table_name, range).await
    }

    pub async fn merge_shards(&self, source: ShardId, target: ShardId, table_name: String) -> AppResult<ReshardJob> {
        self.resharder.start_merge(source, target, table_name).await
    }

    pub async fn get_reshard_job(&self, id: JobId) -> AppResult<ReshardJob> {
        self.resharder.get_job(id).await
    }

    pub async fn promote_replica(&self, shard_id: ShardId, replica_url: String) -> AppResult<Shard> {
        self.health.promote(shard_id, &replica_url).await
    }

    /// Reads via the primary, for callers that need read-your-writes
    /// consistency (spec §4.3 `QueryStrong`).
    pub async fn query_strong(&self, key: &[u8], sql: &str, params: &[Value]) -> AppResult<QueryOutcome> {
        Self::check_payload_size(sql.as_bytes())?;
        self.router.query_strong(key, sql, params).await
    }

    /// Reads via a healthy replica when one is configured, falling back
    /// to the primary (spec §4.3 `QueryEventual`).
    pub async fn query_eventual(&self, key: &[u8], sql: &str, params: &[Value]) -> AppResult<QueryOutcome> {
        Self::check_payload_size(sql.as_bytes())?;
        self.router.query_eventual(key, sql, params).await
    }

    /// Writes always land on the primary (spec §4.3 `Execute`).
    pub async fn execute(&self, key: &[u8], sql: &str, params: &[Value]) -> AppResult<u64> {
        Self::check_payload_size(sql.as_bytes())?;
        self.router.execute(key, sql, params).await
    }
}
