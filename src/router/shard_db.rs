//! The resolved target of a routing decision: a shard id plus the pool a
//! caller should run its query against.

use sqlx::PgPool;

use crate::catalog::model::ShardId;

/// What `Router::lookup_shard` / `query_strong` / `query_eventual` hand
/// back: enough to run a query and to label it in logs/metrics.
#[derive(Clone)]
pub struct ShardTarget {
    pub shard_id: ShardId,
    pub pool: PgPool,
}
