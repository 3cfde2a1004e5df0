//! The thin Control API surface (spec §7). Grounded in the teacher's
//! `tao_interface.rs` router-building shape (state-extractor handlers
//! returning `AppResult<Json<_>>`, nested under one `Router::new()`), but
//! over this crate's own operations instead of TAO's entity/association
//! CRUD. Authentication/authorization are explicitly out of scope (spec
//! Non-goals) and are expected to sit in front of this router as
//! middleware the embedder supplies.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::catalog::model::{Shard, ShardId};
use crate::config::ConsistencyLevel;
use crate::error::{AppError, AppResult};
use crate::health::ShardHealthReport;
use crate::resharder::model::{JobId, ReshardJob};
use crate::ring::HashRange;
use crate::router::rows::ShardRow;
use crate::service::{ShardingService, MAX_PAYLOAD_BYTES};

pub fn build_router(service: Arc<ShardingService>) -> AxumRouter {
    AxumRouter::new()
        .route("/shards", post(create_shard).get(list_shards))
        .route("/shards/:id", get(get_shard).delete(delete_shard))
        .route("/shards/:id/split", post(split_shard))
        .route("/shards/:id/promote", post(promote_replica))
        .route("/shards/merge", post(merge_shards))
        .route("/jobs/:id", get(get_reshard_job))
        .route("/query", post(query))
        .route("/health/shards/:id", get(shard_health))
        .route("/health/shards", get(all_shard_health))
        .route("/autoscale/hot", get(hot_shards))
        .route("/autoscale/cold", get(cold_shards))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[derive(Debug, Deserialize)]
struct CreateShardRequest {
    name: String,
    primary_url: String,
    #[serde(default)]
    replica_urls: Vec<String>,
    #[serde(default)]
    vnode_count: u32,
}

async fn create_shard(
    State(service): State<Arc<ShardingService>>,
    Json(req): Json<CreateShardRequest>,
) -> AppResult<Json<Shard>> {
    let shard = Shard::new(req.name, req.primary_url, req.replica_urls, req.vnode_count);
    let created = service.create_shard(shard).await?;
    Ok(Json(created))
}

async fn list_shards(State(service): State<Arc<ShardingService>>) -> AppResult<Json<Vec<Shard>>> {
    Ok(Json(service.list_shards().await?))
}

async fn get_shard(State(service): State<Arc<ShardingService>>, Path(id): Path<Uuid>) -> AppResult<Json<Shard>> {
    Ok(Json(service.get_shard(id).await?))
}

async fn delete_shard(State(service): State<Arc<ShardingService>>, Path(id): Path<Uuid>) -> AppResult<()> {
    service.delete_shard(id).await
}

#[derive(Debug, Deserialize)]
struct SplitShardRequest {
    target_shard: ShardId,
    table_name: String,
    range_lo: u64,
    range_hi: u64,
}

async fn split_shard(
    State(service): State<Arc<ShardingService>>,
    Path(source): Path<Uuid>,
    Json(req): Json<SplitShardRequest>,
) -> AppResult<Json<ReshardJob>> {
    let job = service
        .split_shard(
            source,
            req.target_shard,
            req.table_name,
            HashRange { lo: req.range_lo, hi: req.range_hi },
        )
        .await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct MergeShardsRequest {
    source_shard: ShardId,
    target_shard: ShardId,
    table_name: String,
}

async fn merge_shards(
    State(service): State<Arc<ShardingService>>,
    Json(req): Json<MergeShardsRequest>,
) -> AppResult<Json<ReshardJob>> {
    let job = service.merge_shards(req.source_shard, req.target_shard, req.table_name).await?;
    Ok(Json(job))
}

async fn get_reshard_job(State(service): State<Arc<ShardingService>>, Path(id): Path<JobId>) -> AppResult<Json<ReshardJob>> {
    Ok(Json(service.get_reshard_job(id).await?))
}

#[derive(Debug, Deserialize)]
struct PromoteReplicaRequest {
    replica_url: String,
}

async fn promote_replica(
    State(service): State<Arc<ShardingService>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PromoteReplicaRequest>,
) -> AppResult<Json<Shard>> {
    Ok(Json(service.promote_replica(id, req.replica_url).await?))
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    key: String,
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    consistency: ConsistencyLevel,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    shard_id: ShardId,
    rows: Vec<ShardRow>,
    latency_ms: u128,
}

/// The control API's pass-through for spec §6's `Query(key, sql, params,
/// consistency)` operation. A write detected by the caller's chosen
/// consistency being irrelevant still always lands on the primary via
/// `ShardingService::execute`, left to callers that know their statement
/// mutates data; this endpoint only exposes the read path.
async fn query(
    State(service): State<Arc<ShardingService>>,
    Json(req): Json<QueryRequest>,
) -> AppResult<Json<QueryResponse>> {
    let outcome = match req.consistency {
        ConsistencyLevel::Strong => service.query_strong(req.key.as_bytes(), &req.sql, &req.params).await?,
        ConsistencyLevel::Eventual => service.query_eventual(req.key.as_bytes(), &req.sql, &req.params).await?,
    };
    Ok(Json(QueryResponse {
        shard_id: outcome.shard_id,
        rows: outcome.rows,
        latency_ms: outcome.latency.as_millis(),
    }))
}

async fn shard_health(State(service): State<Arc<ShardingService>>, Path(id): Path<Uuid>) -> Json<ShardHealthReport> {
    Json(service.health.report(id).await)
}

async fn all_shard_health(State(service): State<Arc<ShardingService>>) -> Json<Vec<ShardHealthReport>> {
    Json(service.health.all_reports().await)
}

#[derive(Debug, Serialize)]
struct ScaleCandidatesResponse {
    candidates: Vec<crate::autoscale::ScaleCandidate>,
}

async fn hot_shards(State(service): State<Arc<ShardingService>>) -> Json<ScaleCandidatesResponse> {
    Json(ScaleCandidatesResponse {
        candidates: service.autoscale.hot_shards().await,
    })
}

async fn cold_shards(State(service): State<Arc<ShardingService>>) -> Json<ScaleCandidatesResponse> {
    Json(ScaleCandidatesResponse {
        candidates: service.autoscale.cold_shards().await,
    })
}
