use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ring::DEFAULT_VNODE_COUNT;
use crate::util::clock::now_millis;

pub type ShardId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Active,
    Migrating,
    Readonly,
    Inactive,
}

impl ShardStatus {
    /// Status transitions allowed by the resharder's phase machine
    /// (spec §4.4): active -> migrating (source, during a job) -> readonly
    /// (cutover) -> inactive (completed); or active <-> migrating for a
    /// target that is being created and then opened for traffic.
    /// `Migrating -> Inactive` is a target-only path: a job rolled back
    /// before cutover retires a target it created without ever opening it
    /// for traffic.
    pub fn can_transition_to(self, next: ShardStatus) -> bool {
        use ShardStatus::*;
        if next == self {
            return true;
        }
        matches!(
            (self, next),
            (Active, Migrating)
                | (Active, Readonly)
                | (Migrating, Active)
                | (Migrating, Readonly)
                | (Migrating, Inactive)
                | (Readonly, Active)
                | (Readonly, Inactive)
                | (Readonly, Migrating)
        )
    }
}

/// A primary+replicas group owning a contiguous region of hash space
/// (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub name: String,
    pub primary_url: String,
    pub replica_urls: Vec<String>,
    pub status: ShardStatus,
    pub vnode_count: u32,
    pub app_id: Option<String>,
    /// Column whose value the resharder hashes during precopy/delta-sync.
    /// Kept distinct from the row primary key per spec §9's resolved
    /// design note.
    pub shard_key_column: String,
    pub version: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Shard {
    pub fn new(name: String, primary_url: String, replica_urls: Vec<String>, vnode_count: u32) -> Shard {
        let now = now_millis();
        Shard {
            id: Uuid::new_v4(),
            name,
            primary_url,
            replica_urls,
            status: ShardStatus::Active,
            vnode_count: if vnode_count == 0 {
                DEFAULT_VNODE_COUNT
            } else {
                vnode_count
            },
            app_id: None,
            shard_key_column: "shard_key".to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validates the invariants from spec §3: primary URL non-empty,
    /// replica URLs unique, vnode count within [1, 1024].
    pub fn validate(&self) -> AppResult<()> {
        if self.primary_url.trim().is_empty() {
            return Err(AppError::Validation("primary url must not be empty".into()));
        }
        if !(1..=1024).contains(&self.vnode_count) {
            return Err(AppError::Validation(format!(
                "vnode_count {} out of range [1, 1024]",
                self.vnode_count
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for url in &self.replica_urls {
            if url == &self.primary_url {
                return Err(AppError::Validation(
                    "primary url must not also appear as a replica".into(),
                ));
            }
            if !seen.insert(url) {
                return Err(AppError::Validation(format!(
                    "duplicate replica url: {url}"
                )));
            }
        }
        Ok(())
    }

    /// Applies a status transition, bumping the version counter. Callers
    /// are expected to persist this through the catalog's
    /// compare-and-swap, not mutate a cached copy directly.
    pub fn transition(&mut self, next: ShardStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "illegal shard status transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.version += 1;
        self.updated_at = now_millis();
        Ok(())
    }
}

/// Groups shards under an owning application for isolation and key-prefix
/// routing (spec §3). A shard belongs to at most one app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAppBinding {
    pub app_id: String,
    pub shard_id: ShardId,
}

/// A coherent `(shards, vnodes)` snapshot labeled by a monotonic version
/// (spec §3). Consumers observe whole snapshots, never partial updates.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub shards: Vec<Shard>,
    pub bindings: Vec<ClientAppBinding>,
}

impl CatalogSnapshot {
    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shards.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_never_duplicated_in_replicas() {
        let shard = Shard::new(
            "s1".into(),
            "db://primary/d".into(),
            vec!["db://primary/d".into()],
            256,
        );
        assert!(shard.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_vnode_count() {
        let mut shard = Shard::new("s1".into(), "db://primary/d".into(), vec![], 1);
        shard.vnode_count = 2000;
        assert!(shard.validate().is_err());
    }

    #[test]
    fn status_transition_bumps_version() {
        let mut shard = Shard::new("s1".into(), "db://primary/d".into(), vec![], 256);
        let before = shard.version;
        shard.transition(ShardStatus::Readonly).unwrap();
        assert_eq!(shard.version, before + 1);
        assert_eq!(shard.status, ShardStatus::Readonly);
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut shard = Shard::new("s1".into(), "db://primary/d".into(), vec![], 256);
        shard.transition(ShardStatus::Inactive).unwrap_err();
    }
}
