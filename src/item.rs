//! Workflow item model: the tracked subject of automation.
//!
//! One `WorkflowItem` exists per external trigger subject (issue or PR). It
//! records the single active stage, overall status, per-stage retry counters,
//! and a monotonic version used for optimistic concurrency in the state store.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// Overall status of a workflow item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Created but no stage has run yet
    Pending,
    /// A stage is executing or scheduled
    InProgress,
    /// Reached the end of the lifecycle
    Completed,
    /// Terminally failed
    Failed,
    /// Recovery exhausted; a human must act before the engine touches it again
    AwaitingHuman,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingHuman => "awaiting_human",
        }
    }

    /// Terminal statuses are never picked up by the daemon again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "awaiting_human" => Ok(Self::AwaitingHuman),
            _ => Err(format!("Invalid item status: {}", s)),
        }
    }
}

/// One tracked issue/PR moving through the lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowItem {
    /// External item id (issue/PR number as a string)
    pub id: String,
    /// The single active stage
    pub current_stage: Stage,
    pub status: ItemStatus,
    /// Monotonic version, bumped by every store update
    pub version: u64,
    /// Labels observed at the last trigger
    pub labels_snapshot: Vec<String>,
    /// Retry attempts per stage key
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Test-fix round trips, bounded separately from plain retries
    #[serde(default)]
    pub fix_attempts: u32,
    /// Pull request opened by the Implementation stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_id: Option<String>,
    /// Earliest time the next attempt may run (retry backoff)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowItem {
    /// Create a fresh item entering the pipeline at `Planning`.
    pub fn new(id: &str, labels: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            current_stage: Stage::Planning,
            status: ItemStatus::Pending,
            version: 1,
            labels_snapshot: labels,
            retry_counts: BTreeMap::new(),
            fix_attempts: 0,
            pr_id: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Retry attempts recorded for a stage.
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.retry_counts.get(stage.key()).copied().unwrap_or(0)
    }

    /// Record one more attempt for a stage and return the new count.
    pub fn record_attempt(&mut self, stage: Stage) -> u32 {
        let count = self.retry_counts.entry(stage.key().to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Clear the attempt counter when a stage succeeds.
    pub fn reset_attempts(&mut self, stage: Stage) {
        self.retry_counts.remove(stage.key());
    }

    /// Move to a new stage, clearing the old stage's retry counter.
    pub fn advance_to(&mut self, stage: Stage) {
        self.reset_attempts(self.current_stage);
        self.current_stage = stage;
        self.status = match stage {
            Stage::Completed => ItemStatus::Completed,
            Stage::Failed => ItemStatus::Failed,
            Stage::AwaitingHuman => ItemStatus::AwaitingHuman,
            _ => ItemStatus::InProgress,
        };
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_starts_in_planning() {
        let item = WorkflowItem::new("42", vec!["needs-planning".to_string()]);
        assert_eq!(item.current_stage, Stage::Planning);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.version, 1);
    }

    #[test]
    fn attempt_counters_are_per_stage() {
        let mut item = WorkflowItem::new("42", vec![]);
        assert_eq!(item.attempts_for(Stage::Planning), 0);
        assert_eq!(item.record_attempt(Stage::Planning), 1);
        assert_eq!(item.record_attempt(Stage::Planning), 2);
        assert_eq!(item.attempts_for(Stage::Implementation), 0);
    }

    #[test]
    fn advancing_resets_the_old_stage_counter() {
        let mut item = WorkflowItem::new("42", vec![]);
        item.record_attempt(Stage::Planning);
        item.advance_to(Stage::PlanReview);
        assert_eq!(item.attempts_for(Stage::Planning), 0);
        assert_eq!(item.current_stage, Stage::PlanReview);
        assert_eq!(item.status, ItemStatus::InProgress);
    }

    #[test]
    fn advancing_to_terminal_stage_sets_status() {
        let mut item = WorkflowItem::new("42", vec![]);
        item.advance_to(Stage::Completed);
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.status.is_terminal());

        let mut item = WorkflowItem::new("43", vec![]);
        item.advance_to(Stage::AwaitingHuman);
        assert_eq!(item.status, ItemStatus::AwaitingHuman);
        assert!(!item.status.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::InProgress,
            ItemStatus::Completed,
            ItemStatus::Failed,
            ItemStatus::AwaitingHuman,
        ] {
            assert_eq!(ItemStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(ItemStatus::from_str("bogus").is_err());
    }
}
