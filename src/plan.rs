//! Plan and task model: the decomposition of one item's implementation.
//!
//! A `Plan` is created once at the transition into the Implementation stage
//! and its topology is immutable afterwards; adding tasks requires a new
//! revision. Tasks carry dependency edges validated by the graph builder
//! before any dispatch.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// How task branches relate to the item's integration branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    /// One branch per task, merged into the item branch as tasks finish
    #[default]
    BranchPerTask,
    /// All tasks commit to the single item branch
    SingleBranch,
}

/// Status of a single task within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on at least one dependency
    #[default]
    Blocked,
    /// All dependencies succeeded, eligible for dispatch
    Ready,
    /// Currently executing
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error, or blocked by a failed dependency
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Outcome of a finished task: a branch ref on success, error detail on
/// failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskResult {
    Branch { branch_ref: String },
    Error { detail: String },
}

/// An atomic, dependency-bound unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Human-readable description fed to the agent
    pub description: String,
    /// Ids of tasks in the same plan that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(task_id: &str, description: &str, depends_on: Vec<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            description: description.to_string(),
            depends_on,
            status: TaskStatus::default(),
            attempts: 0,
            result: None,
        }
    }
}

/// The task-level decomposition of one item's Implementation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    /// Bumped whenever topology changes; the engine never edits a revision
    pub revision: u32,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub branch_strategy: BranchStrategy,
}

impl Plan {
    pub fn new(tasks: Vec<Task>, branch_strategy: BranchStrategy) -> Self {
        Self {
            plan_id: Uuid::new_v4().to_string(),
            revision: 1,
            tasks,
            branch_strategy,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    /// Parse a plan from agent output.
    ///
    /// Accepts either a bare JSON document or one wrapped in a markdown code
    /// fence, with the shape:
    ///
    /// ```json
    /// { "tasks": [ { "id": "t1", "description": "...", "depends_on": [] } ] }
    /// ```
    pub fn parse_from_agent(output: &str) -> EngineResult<Self> {
        let json = extract_json_block(output);
        let raw: RawPlan = serde_json::from_str(json).map_err(|e| {
            EngineError::permanent(format!("Agent returned an unparsable plan: {}", e))
        })?;

        if raw.tasks.is_empty() {
            return Err(EngineError::permanent("Agent returned an empty plan"));
        }

        let tasks = raw
            .tasks
            .into_iter()
            .map(|t| Task::new(&t.id, &t.description, t.depends_on))
            .collect();

        Ok(Self::new(tasks, raw.branch_strategy.unwrap_or_default()))
    }
}

#[derive(Deserialize)]
struct RawPlan {
    tasks: Vec<RawTask>,
    #[serde(default)]
    branch_strategy: Option<BranchStrategy>,
}

#[derive(Deserialize)]
struct RawTask {
    id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Strip a markdown code fence if the agent wrapped its JSON in one.
pub(crate) fn extract_json_block(output: &str) -> &str {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip an optional language tag on the fence line
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_plan() {
        let output = r#"{"tasks": [
            {"id": "t1", "description": "add model", "depends_on": []},
            {"id": "t2", "description": "wire api", "depends_on": ["t1"]}
        ]}"#;

        let plan = Plan::parse_from_agent(output).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.revision, 1);
        assert_eq!(plan.tasks[1].depends_on, vec!["t1"]);
        assert_eq!(plan.branch_strategy, BranchStrategy::BranchPerTask);
    }

    #[test]
    fn parses_fenced_json_plan() {
        let output = "Here is the plan:\n```json\n{\"tasks\": [{\"id\": \"t1\", \"description\": \"x\"}]}\n```\nDone.";
        let plan = Plan::parse_from_agent(output).unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].task_id, "t1");
    }

    #[test]
    fn rejects_empty_plan() {
        let err = Plan::parse_from_agent(r#"{"tasks": []}"#).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejects_garbage_output() {
        assert!(Plan::parse_from_agent("I could not produce a plan").is_err());
    }

    #[test]
    fn task_mut_finds_tasks_by_id() {
        let mut plan = Plan::new(
            vec![
                Task::new("t1", "a", vec![]),
                Task::new("t2", "b", vec!["t1".to_string()]),
            ],
            BranchStrategy::default(),
        );
        plan.task_mut("t1").unwrap().status = TaskStatus::Succeeded;
        assert_eq!(plan.task("t1").unwrap().status, TaskStatus::Succeeded);
        assert!(plan.task_mut("missing").is_none());
    }

    #[test]
    fn task_status_round_trips() {
        for status in [
            TaskStatus::Blocked,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()).unwrap(), status);
        }
    }
}
