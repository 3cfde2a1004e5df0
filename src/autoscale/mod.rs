//! Hot/cold auto-scale detection (spec §4.6). Classifies shards against
//! the thresholds in `AutoScaleConfig` and, when `enabled`, enqueues a
//! split for a sustained hot shard or flags a sustained cold shard as a
//! merge candidate. Grounded in the teacher's `SystemMetrics`/
//! `ConnectionPoolStats` shape (`infrastructure/monitoring.rs`) for what
//! a "classification window" looks like, generalized from a single
//! process-wide metric set to one per shard.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::catalog::model::ShardId;
use crate::catalog::Catalog;
use crate::config::AutoScaleConfig;
use crate::health::{EndpointHealth, HealthMonitor};
use crate::util::clock::now_millis;

/// Per-shard measurements a real deployment would source from the
/// router's connection-pool stats and the database's own storage/CPU
/// telemetry. This crate's auto-scale detector consumes whatever
/// implements this trait; the control-plane binary is responsible for
/// wiring a real collector in (spec §4.6 leaves metric collection itself
/// out of scope — only the classification and action are in-crate).
pub trait ShardMetricsSource: Send + Sync {
    fn qps(&self, shard_id: ShardId) -> f64;
    fn storage_percent(&self, shard_id: ShardId) -> f64;
    fn cpu_percent(&self, shard_id: ShardId) -> f64;
    fn active_connections(&self, shard_id: ShardId) -> u32;
    fn p99_latency_ms(&self, shard_id: ShardId) -> u64;
}

/// A metrics source that always reports idle, used when the embedder has
/// not wired a real telemetry collector in. Every shard classifies as
/// `Normal`, so the detector never acts — equivalent to running with
/// auto-scale observation but no signal.
pub struct NullMetricsSource;

impl ShardMetricsSource for NullMetricsSource {
    fn qps(&self, _: ShardId) -> f64 {
        0.0
    }
    fn storage_percent(&self, _: ShardId) -> f64 {
        0.0
    }
    fn cpu_percent(&self, _: ShardId) -> f64 {
        0.0
    }
    fn active_connections(&self, _: ShardId) -> u32 {
        0
    }
    fn p99_latency_ms(&self, _: ShardId) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Hot,
    Cold,
    Normal,
}

#[derive(Debug, Default)]
struct Streak {
    hot_windows: u32,
    cold_windows: u32,
    last_action_ms: i64,
}

/// A shard that has been sustained-hot or sustained-cold for
/// `sustained_windows` consecutive classification rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleCandidate {
    pub shard_id: ShardId,
    pub classification: Classification,
}

pub struct AutoScaleDetector {
    catalog: Arc<Catalog>,
    health: Arc<HealthMonitor>,
    metrics: Arc<dyn ShardMetricsSource>,
    config: AutoScaleConfig,
    streaks: RwLock<HashMap<ShardId, Streak>>,
    candidates: RwLock<Vec<ScaleCandidate>>,
}

impl AutoScaleDetector {
    pub fn new(
        catalog: Arc<Catalog>,
        health: Arc<HealthMonitor>,
        metrics: Arc<dyn ShardMetricsSource>,
        config: AutoScaleConfig,
    ) -> Self {
        Self {
            catalog,
            health,
            metrics,
            config,
            streaks: RwLock::new(HashMap::new()),
            candidates: RwLock::new(Vec::new()),
        }
    }

    pub async fn spawn(self: Arc<Self>) {
        if !self.config.enabled {
            info!("autoscale: disabled, detector not started");
            return;
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Err(e) = self.classify_round().await {
                    warn!("autoscale: classification round failed: {e}");
                }
            }
        });
    }

    fn classify(&self, shard_id: ShardId) -> Classification {
        let qps = self.metrics.qps(shard_id);
        let storage = self.metrics.storage_percent(shard_id);
        let cpu = self.metrics.cpu_percent(shard_id);
        let connections = self.metrics.active_connections(shard_id);
        let p99 = self.metrics.p99_latency_ms(shard_id);

        let hot = qps >= self.config.qps_threshold
            || storage >= self.config.storage_hot_percent
            || cpu >= self.config.cpu_hot_percent
            || connections >= self.config.connections_hot
            || p99 >= self.config.p99_hot_ms;

        let cold = qps <= self.config.qps_threshold / 100.0
            && storage <= self.config.storage_cold_percent
            && cpu <= self.config.cpu_cold_percent;

        if hot {
            Classification::Hot
        } else if cold {
            Classification::Cold
        } else {
            Classification::Normal
        }
    }

    async fn classify_round(&self) -> crate::error::AppResult<()> {
        let shards = self.catalog.active_shards().await?;
        let mut streaks = self.streaks.write().await;
        let mut new_candidates = Vec::new();

        for shard in &shards {
            // A shard mid-failover is not a meaningful scale signal yet;
            // let it settle before counting it toward a streak.
            if self.health.report(shard.id).await.status == EndpointHealth::Unhealthy {
                continue;
            }

            let classification = self.classify(shard.id);
            let streak = streaks.entry(shard.id).or_default();

            match classification {
                Classification::Hot => {
                    streak.hot_windows += 1;
                    streak.cold_windows = 0;
                }
                Classification::Cold => {
                    streak.cold_windows += 1;
                    streak.hot_windows = 0;
                }
                Classification::Normal => {
                    streak.hot_windows = 0;
                    streak.cold_windows = 0;
                }
            }

            let cooldown_elapsed = now_millis() - streak.last_action_ms > self.config.cooldown().as_millis() as i64;

            if streak.hot_windows >= self.config.sustained_windows && cooldown_elapsed {
                streak.last_action_ms = now_millis();
                new_candidates.push(ScaleCandidate {
                    shard_id: shard.id,
                    classification: Classification::Hot,
                });
            } else if streak.cold_windows >= self.config.sustained_windows && cooldown_elapsed && shards.len() > 1 {
                streak.last_action_ms = now_millis();
                new_candidates.push(ScaleCandidate {
                    shard_id: shard.id,
                    classification: Classification::Cold,
                });
            }
        }
        drop(streaks);

        if !new_candidates.is_empty() {
            info!("autoscale: {} new scale candidate(s)", new_candidates.len());
            self.candidates.write().await.extend(new_candidates);
        }

        Ok(())
    }

    /// Shards sustained-hot for `sustained_windows` consecutive rounds —
    /// split candidates (spec §4.6 `HotShards`). Does not itself enqueue a
    /// resharder job; the control plane decides whether to act.
    pub async fn hot_shards(&self) -> Vec<ScaleCandidate> {
        self.candidates
            .read()
            .await
            .iter()
            .filter(|c| c.classification == Classification::Hot)
            .cloned()
            .collect()
    }

    /// Shards sustained-cold for `sustained_windows` consecutive rounds —
    /// merge candidates (spec §4.6 `ColdShards`).
    pub async fn cold_shards(&self) -> Vec<ScaleCandidate> {
        self.candidates
            .read()
            .await
            .iter()
            .filter(|c| c.classification == Classification::Cold)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory_store::InMemoryMetadataStore;
    use crate::catalog::model::Shard;
    use crate::config::HealthConfig;
    use crate::router::Router;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    struct FixedMetrics(Mutex<StdHashMap<ShardId, f64>>);

    impl ShardMetricsSource for FixedMetrics {
        fn qps(&self, shard_id: ShardId) -> f64 {
            *self.0.lock().unwrap().get(&shard_id).unwrap_or(&0.0)
        }
        fn storage_percent(&self, _: ShardId) -> f64 {
            0.0
        }
        fn cpu_percent(&self, _: ShardId) -> f64 {
            0.0
        }
        fn active_connections(&self, _: ShardId) -> u32 {
            0
        }
        fn p99_latency_ms(&self, _: ShardId) -> u64 {
            0
        }
    }

    #[tokio::test]
    async fn classify_flags_hot_shard_by_qps() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let catalog = Arc::new(Catalog::new(store));
        let shard = Shard::new("a".into(), "postgres://a/db".into(), vec![], 64);
        catalog.create_shard(shard.clone()).await.unwrap();

        let router = Arc::new(Router::new(catalog.clone(), crate::config::RouterConfig::default()).await.unwrap());
        let health = Arc::new(HealthMonitor::new(catalog.clone(), router, HealthConfig::default()));

        let mut metrics_map = StdHashMap::new();
        metrics_map.insert(shard.id, 999_999.0);
        let metrics = Arc::new(FixedMetrics(Mutex::new(metrics_map)));

        let config = AutoScaleConfig {
            enabled: true,
            sustained_windows: 1,
            ..AutoScaleConfig::default()
        };
        let detector = AutoScaleDetector::new(catalog, health, metrics, config);
        assert_eq!(detector.classify(shard.id), Classification::Hot);
    }
}
