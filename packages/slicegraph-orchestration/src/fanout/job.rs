use crate::contract::RuleSetRef;
use crate::fanout::config::FanoutPriority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanoutJobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    AsyncQueued,
}

impl FanoutJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::AsyncQueued => "ASYNC_QUEUED",
        }
    }
}

impl std::fmt::Display for FanoutJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Downstream entity to re-slice at `version`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FanoutCandidate {
    pub entity_key: String,
    pub version: u64,
}

/// Fanout work for one dependency of one upstream change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutJob {
    pub id: Uuid,
    pub tenant_id: String,
    pub upstream_entity_type: String,
    pub upstream_entity_key: String,
    pub upstream_version: u64,
    pub downstream_entity_type: String,
    pub index_type: String,
    pub rule_set: RuleSetRef,
    pub total_affected: usize,
    pub processed_count: usize,
    pub status: FanoutJobStatus,
    pub priority: FanoutPriority,
}

impl FanoutJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: &str,
        upstream_entity_type: &str,
        upstream_entity_key: &str,
        upstream_version: u64,
        downstream_entity_type: &str,
        index_type: &str,
        rule_set: RuleSetRef,
        total_affected: usize,
        priority: FanoutPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            upstream_entity_type: upstream_entity_type.to_string(),
            upstream_entity_key: upstream_entity_key.to_string(),
            upstream_version,
            downstream_entity_type: downstream_entity_type.to_string(),
            index_type: index_type.to_string(),
            rule_set,
            total_affected,
            processed_count: 0,
            status: FanoutJobStatus::Pending,
            priority,
        }
    }

    /// `processed / total`, 1.0 when nothing is affected
    pub fn progress(&self) -> f64 {
        if self.total_affected == 0 {
            1.0
        } else {
            self.processed_count as f64 / self.total_affected as f64
        }
    }

    /// ASYNC_QUEUED is not complete: the queue still owns the work
    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            FanoutJobStatus::Completed | FanoutJobStatus::Failed | FanoutJobStatus::Skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(total: usize) -> FanoutJob {
        FanoutJob::new(
            "t1",
            "BRAND",
            "BRAND#t1#BR001",
            2,
            "PRODUCT",
            "product_by_brand",
            RuleSetRef::new("product", "1"),
            total,
            FanoutPriority::Normal,
        )
    }

    #[test]
    fn test_progress() {
        assert_eq!(job(0).progress(), 1.0);

        let mut j = job(150);
        assert_eq!(j.progress(), 0.0);
        j.processed_count = 75;
        assert!((j.progress() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_is_complete() {
        let mut j = job(1);
        for (status, complete) in [
            (FanoutJobStatus::Pending, false),
            (FanoutJobStatus::InProgress, false),
            (FanoutJobStatus::AsyncQueued, false),
            (FanoutJobStatus::Completed, true),
            (FanoutJobStatus::Failed, true),
            (FanoutJobStatus::Skipped, true),
        ] {
            j.status = status;
            assert_eq!(j.is_complete(), complete, "{}", status);
        }
    }
}
