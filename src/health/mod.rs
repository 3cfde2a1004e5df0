//! Health monitoring and failover (spec §4.5). Grounded in the teacher's
//! `MetricsCollector` (`infrastructure/monitoring.rs`): a `ServiceStatus`
//! enum, per-component health behind `RwLock<HashMap<..>>`, refreshed by
//! a periodic task — generalized here from "component" to "shard primary
//! and its replicas" and wired to actually act on a sustained failure
//! (promote a replica) instead of only reporting it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::catalog::model::{Shard, ShardId};
use crate::catalog::Catalog;
use crate::config::HealthConfig;
use crate::router::pool::EndpointRole;
use crate::router::Router;
use crate::util::clock::now_millis;

/// Mirrors the teacher's `ServiceStatus`, narrowed to what a shard
/// endpoint probe can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProbeState {
    status: EndpointHealth,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_checked_ms: i64,
    last_promotion_ms: i64,
}

impl Default for ProbeState {
    fn default() -> Self {
        Self {
            status: EndpointHealth::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_checked_ms: 0,
            last_promotion_ms: 0,
        }
    }
}

/// A point-in-time health report for one shard, returned by the control
/// API's `HealthReport` operation (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardHealthReport {
    pub shard_id: ShardId,
    pub status: EndpointHealth,
    pub consecutive_failures: u32,
}

pub struct HealthMonitor {
    catalog: Arc<Catalog>,
    router: Arc<Router>,
    config: HealthConfig,
    probes: RwLock<HashMap<ShardId, ProbeState>>,
}

impl HealthMonitor {
    pub fn new(catalog: Arc<Catalog>, router: Arc<Router>, config: HealthConfig) -> Self {
        Self {
            catalog,
            router,
            config,
            probes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval());
            loop {
                interval.tick().await;
                if let Err(e) = self.probe_all().await {
                    warn!("health: probe round failed: {e}");
                }
            }
        });
    }

    async fn probe_all(&self) -> crate::error::AppResult<()> {
        let shards = self.catalog.active_shards().await?;
        for shard in shards {
            self.probe_shard(&shard).await;
        }
        Ok(())
    }

    async fn probe_shard(&self, shard: &Shard) {
        let reachable = match self.router.target_for_shard(shard.id, EndpointRole::Primary).await {
            Ok(target) => sqlx::query("SELECT 1").execute(&target.pool).await.is_ok(),
            Err(_) => false,
        };

        let mut probes = self.probes.write().await;
        let state = probes.entry(shard.id).or_default();
        state.last_checked_ms = now_millis();

        if reachable {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if state.consecutive_successes >= self.config.recovery_threshold {
                state.status = EndpointHealth::Healthy;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if state.consecutive_failures >= self.config.unhealthy_threshold {
                state.status = EndpointHealth::Unhealthy;
            }
        }

        let should_failover = state.status == EndpointHealth::Unhealthy
            && now_millis() - state.last_promotion_ms > self.config.promotion_cooldown().as_millis() as i64;

        if should_failover {
            state.last_promotion_ms = now_millis();
            drop(probes);
            self.failover(shard.clone()).await;
        }
    }

    /// Promotes the first replica to primary via the catalog's
    /// compare-and-swap, demoting the unreachable primary into the
    /// replica list (spec §4.5). No replica means no action is possible;
    /// the shard simply stays reported unhealthy.
    async fn failover(&self, shard: Shard) {
        if shard.replica_urls.is_empty() {
            warn!("health: shard {} primary unreachable and has no replicas to promote", shard.id);
            return;
        }

        let new_primary = shard.replica_urls[0].clone();
        if let Err(e) = self.promote(shard.id, &new_primary).await {
            warn!("health: automatic failover for shard {} failed: {e}", shard.id);
        }
    }

    /// Promotes `replica_url` to primary for `shard_id` via the catalog's
    /// compare-and-swap (spec §6 `PromoteReplica`, used both by automatic
    /// failover and by an operator-triggered manual promotion through the
    /// control API). If another controller already promoted a different
    /// replica concurrently, the CAS naturally rejects this one and the
    /// caller should re-observe rather than retry blindly (spec §4.5
    /// step 4).
    pub async fn promote(&self, shard_id: ShardId, replica_url: &str) -> crate::error::AppResult<Shard> {
        let shard = self
            .catalog
            .get_shard(shard_id)
            .await?
            .ok_or_else(|| crate::error::AppError::NotFound(format!("shard {shard_id}")))?;

        if !shard.replica_urls.iter().any(|r| r == replica_url) {
            return Err(crate::error::AppError::Validation(format!(
                "{replica_url} is not a replica of shard {shard_id}"
            )));
        }

        let old_primary = shard.primary_url.clone();
        let promoted = replica_url.to_string();

        let updated = self
            .catalog
            .update_shard(shard_id, move |s| {
                let mut remaining: Vec<String> =
                    s.replica_urls.iter().filter(|r| *r != &promoted).cloned().collect();
                remaining.push(old_primary.clone());
                s.primary_url = promoted.clone();
                s.replica_urls = remaining;
                Ok(())
            })
            .await?;

        info!("health: promoted {replica_url} to primary for shard {shard_id}");

        let mut probes = self.probes.write().await;
        let state = probes.entry(shard_id).or_default();
        state.last_promotion_ms = now_millis();
        state.consecutive_failures = 0;
        state.status = EndpointHealth::Healthy;

        Ok(updated)
    }

    pub async fn report(&self, shard_id: ShardId) -> ShardHealthReport {
        let probes = self.probes.read().await;
        let state = probes.get(&shard_id).cloned().unwrap_or_default();
        ShardHealthReport {
            shard_id,
            status: state.status,
            consecutive_failures: state.consecutive_failures,
        }
    }

    pub async fn all_reports(&self) -> Vec<ShardHealthReport> {
        let probes = self.probes.read().await;
        probes
            .iter()
            .map(|(id, state)| ShardHealthReport {
                shard_id: *id,
                status: state.status,
                consecutive_failures: state.consecutive_failures,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_probe_state_is_unknown() {
        let state = ProbeState::default();
        assert_eq!(state.status, EndpointHealth::Unknown);
    }
}
