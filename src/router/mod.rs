//! Query routing (spec §4.1/§5): resolves a shard key to a shard and a
//! live connection, keeping the hash ring in sync with the catalog via a
//! debounced watch rather than a poll.
//!
//! Grounded in the teacher's `TaoQueryRouter` (lazy per-shard database
//! instances behind an `RwLock`) and `ConsistentHashingShardManager`
//! (topology held behind its own lock, rebuilt on membership change).

pub mod pool;
pub mod rows;
pub mod shard_db;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::catalog::model::{Shard, ShardId, ShardStatus};
use crate::catalog::Catalog;
use crate::config::{ConsistencyLevel, RouterConfig};
use crate::error::{AppError, AppResult};
use crate::ring::Ring;
use pool::{EndpointRole, PoolRegistry};
use rows::{row_to_map, ShardRow};
use shard_db::ShardTarget;

/// Races `fut` against `deadline`, turning an elapsed deadline into
/// `AppError::Cancelled` (spec §5/§6: every suspension point is bounded by
/// a per-operation deadline; omission implies 30 s).
async fn with_deadline<F: std::future::Future>(deadline: Duration, fut: F) -> AppResult<F::Output> {
    tokio::time::timeout(deadline, fut).await.map_err(|_| AppError::Cancelled)
}

/// The result of a SQL query dispatched through the router (spec §4.3
/// `QueryStrong`/`QueryEventual`): which shard answered, the decoded
/// rows, and how long the round trip took.
#[derive(Debug)]
pub struct QueryOutcome {
    pub shard_id: ShardId,
    pub rows: Vec<ShardRow>,
    pub latency: Duration,
}

struct RoutingState {
    ring: Ring,
    shards_by_id: std::collections::HashMap<ShardId, Shard>,
    catalog_version: u64,
}

/// The live router: one per process, shared by every request handler.
pub struct Router {
    catalog: Arc<Catalog>,
    pools: PoolRegistry,
    config: RouterConfig,
    state: RwLock<RoutingState>,
}

impl Router {
    /// Builds the initial ring from the catalog's current snapshot. Does
    /// not start the background reconciler — call `spawn_reconciler` for
    /// that once the router is wrapped in an `Arc`.
    pub async fn new(catalog: Arc<Catalog>, config: RouterConfig) -> AppResult<Self> {
        let snapshot = catalog.snapshot().await?;
        let ring = Ring::build(&snapshot.shards)?;
        let shards_by_id = snapshot.shards.into_iter().map(|s| (s.id, s)).collect();

        Ok(Self {
            pools: PoolRegistry::new(config.clone()),
            catalog,
            config,
            state: RwLock::new(RoutingState {
                ring,
                shards_by_id,
                catalog_version: snapshot.version,
            }),
        })
    }

    /// Runs forever, rebuilding the ring each time the catalog reports a
    /// newer version. Debounced: a burst of catalog writes (e.g. a
    /// resharder job touching several keys in one transaction) collapses
    /// into a single rebuild, per spec §5's "only the freshest decision
    /// wins" requirement.
    pub async fn spawn_reconciler(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let mut stream = match self.catalog.watch().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("router: catalog watch failed, retrying: {e}");
                        tokio::time::sleep(self.config.ring_refresh_debounce()).await;
                        continue;
                    }
                };

                while let Some(result) = stream.next().await {
                    match result {
                        Ok(snapshot) => {
                            tokio::time::sleep(self.config.ring_refresh_debounce()).await;
                            if let Err(e) = self.apply_snapshot(snapshot).await {
                                warn!("router: failed to apply catalog snapshot: {e}");
                            }
                        }
                        Err(e) => warn!("router: catalog watch stream error: {e}"),
                    }
                }

                warn!("router: catalog watch stream ended, reconnecting");
            }
        });
    }

    async fn apply_snapshot(&self, snapshot: crate::catalog::model::CatalogSnapshot) -> AppResult<()> {
        let mut state = self.state.write().await;
        // Monotonic ordering: a stale snapshot racing a fresher one must
        // never overwrite it (spec §5).
        if snapshot.version <= state.catalog_version {
            return Ok(());
        }

        let ring = Ring::build(&snapshot.shards)?;
        let stale_shards: Vec<ShardId> = state
            .shards_by_id
            .keys()
            .filter(|id| {
                snapshot
                    .shards
                    .iter()
                    .find(|s| s.id == **id)
                    .map(|s| s.primary_url != state.shards_by_id[*id].primary_url || s.replica_urls != state.shards_by_id[*id].replica_urls)
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        state.ring = ring;
        state.catalog_version = snapshot.version;
        state.shards_by_id = snapshot.shards.into_iter().map(|s| (s.id, s)).collect();
        drop(state);

        for shard_id in stale_shards {
            self.pools.evict(shard_id).await;
        }

        info!("router: ring reconciled");
        Ok(())
    }

    /// Resolves `key` to the owning shard without opening a connection
    /// (spec §4.1 `LookupShard`).
    pub async fn lookup_shard(&self, key: &[u8]) -> AppResult<ShardId> {
        let state = self.state.read().await;
        state.ring.lookup(key)
    }

    async fn shard_record(&self, shard_id: ShardId) -> AppResult<Shard> {
        let state = self.state.read().await;
        state
            .shards_by_id
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("shard {shard_id}")))
    }

    /// Resolves a specific already-known shard for execution (spec §4.1
    /// `Execute`, used by the resharder and control-plane operations that
    /// already hold a shard id rather than a key).
    pub async fn target_for_shard(&self, shard_id: ShardId, role: EndpointRole) -> AppResult<ShardTarget> {
        let shard = self.shard_record(shard_id).await?;
        let pool = match role {
            EndpointRole::Primary => self.pools.primary(&shard).await?,
            EndpointRole::Replica(_) => self.pools.replica_round_robin(&shard).await?,
        };
        Ok(ShardTarget { shard_id, pool })
    }

    pub async fn current_ring_version(&self) -> u64 {
        self.state.read().await.catalog_version
    }

    /// Runs `sql` against the primary of the shard owning `key` (spec
    /// §4.3 `QueryStrong`). Always the primary, regardless of the
    /// router's configured default consistency.
    pub async fn query_strong(&self, key: &[u8], sql: &str, params: &[Value]) -> AppResult<QueryOutcome> {
        let target = self.query_strong_target(key).await?;
        self.run_query(target, sql, params).await
    }

    /// Runs `sql` against a healthy replica of the shard owning `key`,
    /// falling back to the primary when none is configured (spec §4.3
    /// `QueryEventual`). The reported `shard_id` is always the shard's
    /// identity, never which endpoint actually served the read.
    pub async fn query_eventual(&self, key: &[u8], sql: &str, params: &[Value]) -> AppResult<QueryOutcome> {
        let target = self.query_eventual_target(key).await?;
        self.run_query(target, sql, params).await
    }

    /// Runs a write statement against the primary of the shard owning
    /// `key` (spec §4.3 `Execute`), returning the number of rows affected.
    /// Bounded by the configured per-operation deadline (spec §5/§6): an
    /// elapsed deadline surfaces as `AppError::Cancelled`, not a hang.
    pub async fn execute(&self, key: &[u8], sql: &str, params: &[Value]) -> AppResult<u64> {
        let target = self.query_strong_target(key).await?;
        let query = rows::bind_params(sqlx::query(sql), params);
        let result = with_deadline(self.config.query_timeout(), query.execute(&target.pool))
            .await?
            .map_err(AppError::query_failed)?;
        Ok(result.rows_affected())
    }

    async fn query_strong_target(&self, key: &[u8]) -> AppResult<ShardTarget> {
        let shard_id = self.lookup_shard(key).await?;
        let shard = self.shard_record(shard_id).await?;
        if shard.status == ShardStatus::Inactive {
            return Err(AppError::NoShardsAvailable);
        }
        let pool = self.pools.primary(&shard).await?;
        Ok(ShardTarget { shard_id, pool })
    }

    async fn query_eventual_target(&self, key: &[u8]) -> AppResult<ShardTarget> {
        let shard_id = self.lookup_shard(key).await?;
        let shard = self.shard_record(shard_id).await?;
        if shard.status == ShardStatus::Inactive {
            return Err(AppError::NoShardsAvailable);
        }

        let pool = match self.config.default_consistency {
            ConsistencyLevel::Eventual => self.pools.replica_round_robin(&shard).await?,
            ConsistencyLevel::Strong => self.pools.primary(&shard).await?,
        };
        Ok(ShardTarget { shard_id, pool })
    }

    /// Runs `sql` against `target`, bounded by the configured deadline
    /// (spec §5: "every suspension point accepts a cancellation signal
    /// derived from a per-operation deadline"; spec §6: "omission implies
    /// 30 s"). An elapsed deadline maps to `AppError::Cancelled` rather
    /// than letting the caller hang or the query run unbounded.
    async fn run_query(&self, target: ShardTarget, sql: &str, params: &[Value]) -> AppResult<QueryOutcome> {
        let started = Instant::now();
        let query = rows::bind_params(sqlx::query(sql), params);
        let rows = with_deadline(self.config.query_timeout(), query.fetch_all(&target.pool))
            .await?
            .map_err(AppError::query_failed)?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            decoded.push(row_to_map(row)?);
        }

        Ok(QueryOutcome {
            shard_id: target.shard_id,
            rows: decoded,
            latency: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory_store::InMemoryMetadataStore;

    #[tokio::test]
    async fn lookup_shard_fails_with_no_shards() {
        let catalog = Arc::new(Catalog::new(Arc::new(InMemoryMetadataStore::new())));
        let router = Router::new(catalog, RouterConfig::default()).await.unwrap();
        let err = router.lookup_shard(b"user-1").await.unwrap_err();
        assert_eq!(err.kind(), "no-shards-available");
    }

    #[tokio::test]
    async fn lookup_shard_resolves_after_shard_created() {
        let catalog = Arc::new(Catalog::new(Arc::new(InMemoryMetadataStore::new())));
        let shard = Shard::new("a".into(), "postgres://a/db".into(), vec![], 64);
        catalog.create_shard(shard.clone()).await.unwrap();

        let router = Router::new(catalog, RouterConfig::default()).await.unwrap();
        let resolved = router.lookup_shard(b"user-1").await.unwrap();
        assert_eq!(resolved, shard.id);
    }
}
