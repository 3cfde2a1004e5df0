use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level, validated-once-at-startup configuration (spec §6). Every
/// ambient concern the teacher's original `Config` left to defaults is now
/// an explicit, enumerated section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub metadata_store: MetadataStoreConfig,
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub resharder: ResharderConfig,
    pub autoscale: AutoScaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    pub endpoints: Vec<String>,
    pub request_timeout_ms: u64,
    pub tls_ca_path: Option<String>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl MetadataStoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    #[default]
    Strong,
    Eventual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub default_consistency: ConsistencyLevel,
    pub pool_max_open: u32,
    pub pool_max_idle: u32,
    pub pool_max_lifetime_secs: u64,
    pub pool_max_idle_time_secs: u64,
    pub query_timeout_ms: u64,
    pub ring_refresh_debounce_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_consistency: ConsistencyLevel::Strong,
            pool_max_open: 25,
            pool_max_idle: 5,
            pool_max_lifetime_secs: 300,
            pool_max_idle_time_secs: 60,
            query_timeout_ms: 30_000,
            ring_refresh_debounce_ms: 500,
        }
    }
}

impl RouterConfig {
    pub fn pool_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.pool_max_lifetime_secs)
    }

    pub fn pool_max_idle_time(&self) -> Duration {
        Duration::from_secs(self.pool_max_idle_time_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn ring_refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.ring_refresh_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
    pub unhealthy_threshold: u32,
    pub recovery_threshold: u32,
    pub promotion_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 10,
            unhealthy_threshold: 3,
            recovery_threshold: 1,
            promotion_cooldown_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn promotion_cooldown(&self) -> Duration {
        Duration::from_secs(self.promotion_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResharderConfig {
    pub batch_size: u32,
    pub precopy_concurrency: u32,
    pub delta_sync_lag_target_secs: u64,
    pub cutover_drain_window_secs: u64,
    pub max_batch_retries: u32,
}

impl Default for ResharderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            precopy_concurrency: 4,
            delta_sync_lag_target_secs: 5,
            cutover_drain_window_secs: 30,
            max_batch_retries: 5,
        }
    }
}

impl ResharderConfig {
    pub fn delta_sync_lag_target(&self) -> Duration {
        Duration::from_secs(self.delta_sync_lag_target_secs)
    }

    pub fn cutover_drain_window(&self) -> Duration {
        Duration::from_secs(self.cutover_drain_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoScaleConfig {
    pub enabled: bool,
    pub qps_threshold: f64,
    pub storage_hot_percent: f64,
    pub storage_cold_percent: f64,
    pub cpu_hot_percent: f64,
    pub cpu_cold_percent: f64,
    pub connections_hot: u32,
    pub p99_hot_ms: u64,
    pub sustained_windows: u32,
    pub cooldown_mins: u64,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            qps_threshold: 10_000.0,
            storage_hot_percent: 80.0,
            storage_cold_percent: 20.0,
            cpu_hot_percent: 80.0,
            cpu_cold_percent: 20.0,
            connections_hot: 500,
            p99_hot_ms: 1_000,
            sustained_windows: 3,
            cooldown_mins: 15,
        }
    }
}

impl AutoScaleConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_mins * 60)
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "7070".to_string())
                    .parse()
                    .unwrap_or(7070),
            },
            metadata_store: MetadataStoreConfig {
                endpoints: env::var("METADATA_STORE_ENDPOINTS")
                    .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                request_timeout_ms: env::var("METADATA_STORE_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5_000),
                tls_ca_path: env::var("METADATA_STORE_TLS_CA").ok(),
                tls_cert_path: env::var("METADATA_STORE_TLS_CERT").ok(),
                tls_key_path: env::var("METADATA_STORE_TLS_KEY").ok(),
            },
            router: RouterConfig {
                default_consistency: match env::var("ROUTER_DEFAULT_CONSISTENCY").as_deref() {
                    Ok("eventual") => ConsistencyLevel::Eventual,
                    _ => ConsistencyLevel::Strong,
                },
                ..RouterConfig::default()
            },
            health: HealthConfig::default(),
            resharder: ResharderConfig::default(),
            autoscale: AutoScaleConfig {
                enabled: env::var("AUTOSCALE_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false),
                ..AutoScaleConfig::default()
            },
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_defaults_match_spec() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.pool_max_open, 25);
        assert_eq!(cfg.pool_max_idle, 5);
        assert_eq!(cfg.pool_max_lifetime(), Duration::from_secs(300));
        assert_eq!(cfg.pool_max_idle_time(), Duration::from_secs(60));
    }

    #[test]
    fn resharder_defaults_match_spec() {
        let cfg = ResharderConfig::default();
        assert_eq!(cfg.batch_size, 1000);
        assert!(cfg.precopy_concurrency <= 8);
        assert_eq!(cfg.cutover_drain_window_secs, 30);
    }
}
