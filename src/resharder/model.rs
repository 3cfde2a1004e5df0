use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::model::ShardId;
use crate::ring::HashRange;
use crate::util::clock::now_millis;

pub type JobId = Uuid;

/// The resharder's phase machine (spec §4.4): a job moves strictly
/// forward through these phases, except that any phase but `Cutover` and
/// later can fail outright. Rollback after `Cutover` has begun is out of
/// scope (spec §9 decision) — a job that fails there surfaces as `Failed`
/// and needs an operator to reconcile the target shard by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReshardPhase {
    Pending,
    Precopy,
    DeltaSync,
    Cutover,
    Validation,
    Completed,
    Failed,
    RolledBack,
}

impl ReshardPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReshardPhase::Completed | ReshardPhase::Failed | ReshardPhase::RolledBack
        )
    }

    /// Whether a failure in this phase is compensated automatically
    /// (spec §4.4: any phase before `Cutover` rolls back; `Cutover` and
    /// later surface as `Failed` and need an operator).
    pub fn rolls_back_on_failure(self) -> bool {
        matches!(self, ReshardPhase::Pending | ReshardPhase::Precopy | ReshardPhase::DeltaSync)
    }

    fn next_on_success(self) -> Option<ReshardPhase> {
        use ReshardPhase::*;
        match self {
            Pending => Some(Precopy),
            Precopy => Some(DeltaSync),
            DeltaSync => Some(Cutover),
            Cutover => Some(Validation),
            Validation => Some(Completed),
            Completed | Failed | RolledBack => None,
        }
    }
}

/// What kind of reshard this job performs (spec §4.4: split moves part of
/// one shard's key range to a new shard; merge folds a shard's whole
/// range into another and retires it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReshardKind {
    Split,
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshardJob {
    pub id: JobId,
    pub kind: ReshardKind,
    pub source_shard: ShardId,
    pub target_shard: ShardId,
    /// The table being redistributed and the hash range moving to
    /// `target_shard`. A merge moves the source's whole range.
    pub table_name: String,
    pub range: HashRange,
    pub phase: ReshardPhase,
    /// Rows copied so far during precopy, for progress reporting.
    pub rows_copied: u64,
    /// High-water mark of the source's delta log already applied during
    /// delta-sync, used to measure replication lag against the target.
    pub delta_log_cursor: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ReshardJob {
    pub fn new(
        kind: ReshardKind,
        source_shard: ShardId,
        target_shard: ShardId,
        table_name: String,
        range: HashRange,
    ) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            kind,
            source_shard,
            target_shard,
            table_name,
            range,
            phase: ReshardPhase::Pending,
            rows_copied: 0,
            delta_log_cursor: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self) {
        if let Some(next) = self.phase.next_on_success() {
            self.phase = next;
            self.updated_at = now_millis();
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.phase = ReshardPhase::Failed;
        self.error = Some(reason.into());
        self.updated_at = now_millis();
    }

    pub fn rollback(&mut self, reason: impl Into<String>) {
        self.phase = ReshardPhase::RolledBack;
        self.error = Some(reason.into());
        self.updated_at = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn advance_walks_the_full_phase_sequence() {
        let mut job = ReshardJob::new(
            ReshardKind::Split,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "accounts".to_string(),
            HashRange { lo: 0, hi: u64::MAX },
        );
        let expected = [
            ReshardPhase::Precopy,
            ReshardPhase::DeltaSync,
            ReshardPhase::Cutover,
            ReshardPhase::Validation,
            ReshardPhase::Completed,
        ];
        for phase in expected {
            job.advance();
            assert_eq!(job.phase, phase);
        }
        // Advancing past Completed is a no-op.
        job.advance();
        assert_eq!(job.phase, ReshardPhase::Completed);
    }

    #[test]
    fn fail_is_terminal() {
        let mut job = ReshardJob::new(
            ReshardKind::Split,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "accounts".to_string(),
            HashRange { lo: 0, hi: u64::MAX },
        );
        job.fail("source unreachable");
        assert!(job.phase.is_terminal());
        assert_eq!(job.error.as_deref(), Some("source unreachable"));
    }

    #[test]
    fn only_pre_cutover_phases_roll_back_on_failure() {
        assert!(ReshardPhase::Pending.rolls_back_on_failure());
        assert!(ReshardPhase::Precopy.rolls_back_on_failure());
        assert!(ReshardPhase::DeltaSync.rolls_back_on_failure());
        assert!(!ReshardPhase::Cutover.rolls_back_on_failure());
        assert!(!ReshardPhase::Validation.rolls_back_on_failure());
    }

    #[test]
    fn rollback_is_terminal() {
        let mut job = ReshardJob::new(
            ReshardKind::Split,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "accounts".to_string(),
            HashRange { lo: 0, hi: u64::MAX },
        );
        job.rollback("precopy failed");
        assert!(job.phase.is_terminal());
        assert_eq!(job.phase, ReshardPhase::RolledBack);
    }
}
