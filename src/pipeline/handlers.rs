//! Stage handlers and the registry that maps each stage to one.
//!
//! Handlers are a closed set registered in `StageRegistry::standard`. Each is
//! a pure contract over the `StageContext`: it reads item/plan state, calls
//! collaborators, and returns a `StageResult` whose `SideEffects` declare any
//! external mutation. The orchestrator applies those effects — handlers never
//! write labels, comments, or refs themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ForemanConfig;
use crate::errors::{EngineError, EngineResult};
use crate::executor::{ExecutorConfig, ParallelExecutor, TaskRunner};
use crate::graph::GraphBuilder;
use crate::item::WorkflowItem;
use crate::pipeline::{ItemPatch, SideEffects, Stage, StageResult};
use crate::plan::{self, BranchStrategy, Plan, Task, TaskResult, TaskStatus};
use crate::providers::{AgentProvider, AgentRequest, GitProvider, PullRequestSpec, RemoteItem};

/// Labels the pipeline emits as it moves an item forward. The trigger,
/// approval, and needs-human labels are configurable; these are fixed.
pub mod labels {
    /// A plan proposal has been posted
    pub const PROPOSED: &str = "proposed";
    /// The change has been merged
    pub const MERGED: &str = "merged";
}

/// Everything a stage handler may read.
pub struct StageContext {
    pub item: WorkflowItem,
    pub remote: RemoteItem,
    /// Current plan, restored from the latest plan checkpoint
    pub plan: Option<Plan>,
    /// Failing output attached by a test-fix round
    pub fix_context: Option<String>,
    pub git: Arc<dyn GitProvider>,
    pub agent: Arc<dyn AgentProvider>,
    pub config: Arc<ForemanConfig>,
    pub cancel: CancellationToken,
}

impl StageContext {
    fn item_branch(&self) -> String {
        format!("foreman/item-{}", self.item.id)
    }
}

/// One lifecycle stage's executable contract.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;
    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult>;
}

/// Closed mapping from stage to handler. Terminal stages have no entry.
pub struct StageRegistry {
    handlers: HashMap<Stage, Box<dyn StageHandler>>,
}

impl StageRegistry {
    /// The standard lifecycle: every executable stage gets its handler.
    pub fn standard() -> Self {
        let handlers: Vec<Box<dyn StageHandler>> = vec![
            Box::new(PlanningHandler),
            Box::new(PlanReviewHandler),
            Box::new(ApprovalHandler),
            Box::new(ImplementationHandler),
            Box::new(CodeReviewHandler),
            Box::new(QaHandler),
            Box::new(FixHandler),
            Box::new(MergeHandler),
        ];
        Self {
            handlers: handlers.into_iter().map(|h| (h.stage(), h)).collect(),
        }
    }

    pub fn handler_for(&self, stage: Stage) -> Option<&dyn StageHandler> {
        self.handlers.get(&stage).map(|h| h.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Decompose the item into a task plan and post it for review.
struct PlanningHandler;

#[async_trait]
impl StageHandler for PlanningHandler {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let prompt = planning_prompt(&ctx.remote);
        let response = match ctx.agent.generate(AgentRequest::new(prompt)).await {
            Ok(r) => r,
            Err(e) if e.is_retryable() => return Ok(StageResult::retry(e)),
            Err(e) => return Ok(StageResult::escalate(e)),
        };

        let mut new_plan = match Plan::parse_from_agent(&response.output) {
            Ok(p) => p,
            Err(e) => return Ok(StageResult::escalate(e)),
        };

        // A re-plan after review rejection is a new revision, not an edit.
        if let Some(prior) = &ctx.plan {
            new_plan.revision = prior.revision + 1;
        }

        // Validate the topology now: a cyclic plan must never reach dispatch.
        if let Err(e) = GraphBuilder::new(new_plan.tasks.clone()).build() {
            return Ok(StageResult::fatal(e));
        }

        info!(item = %ctx.item.id, tasks = new_plan.tasks.len(), revision = new_plan.revision, "Plan created");

        let effects = SideEffects::default()
            .remove_label(ctx.config.labels.trigger.clone())
            .add_label(labels::PROPOSED)
            .comment(plan_summary(&new_plan));

        Ok(StageResult::success(Stage::PlanReview)
            .with_plan(new_plan)
            .with_side_effects(effects))
    }
}

fn planning_prompt(remote: &RemoteItem) -> String {
    format!(
        "Decompose the following change request into independent implementation tasks.\n\
         Respond with JSON only: {{\"tasks\": [{{\"id\": \"t1\", \"description\": \"...\", \"depends_on\": []}}]}}.\n\
         Task ids must be unique; depends_on may only reference other task ids; no cycles.\n\n\
         Title: {}\n\nDescription:\n{}",
        remote.title, remote.body
    )
}

fn plan_summary(plan: &Plan) -> String {
    let mut lines = vec![format!(
        "Proposed plan (revision {}), {} tasks:",
        plan.revision,
        plan.tasks.len()
    )];
    for task in &plan.tasks {
        if task.depends_on.is_empty() {
            lines.push(format!("- `{}`: {}", task.task_id, task.description));
        } else {
            lines.push(format!(
                "- `{}`: {} (after {})",
                task.task_id,
                task.description,
                task.depends_on.join(", ")
            ));
        }
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// PlanReview
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReviewVerdict {
    approve: bool,
    #[serde(default)]
    reasons: Vec<String>,
}

/// Agent pass over the proposed plan: coherent decomposition, sane
/// dependencies. Rejection loops back to Planning for a new revision.
struct PlanReviewHandler;

#[async_trait]
impl StageHandler for PlanReviewHandler {
    fn stage(&self) -> Stage {
        Stage::PlanReview
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let Some(current) = &ctx.plan else {
            return Ok(StageResult::escalate(EngineError::ManualInterventionRequired {
                reason: "No plan to review".to_string(),
            }));
        };

        let plan_json = serde_json::to_string_pretty(&current.tasks)
            .map_err(|e| EngineError::Other(anyhow::anyhow!("Failed to render plan: {}", e)))?;
        let prompt = format!(
            "Review this implementation plan for a change titled '{}'.\n\
             Check that tasks are atomic, dependencies are sensible, and nothing is missing.\n\
             Respond with JSON only: {{\"approve\": true|false, \"reasons\": [\"...\"]}}.\n\n{}",
            ctx.remote.title, plan_json
        );

        let response = match ctx.agent.generate(AgentRequest::new(prompt)).await {
            Ok(r) => r,
            Err(e) if e.is_retryable() => return Ok(StageResult::retry(e)),
            Err(e) => return Ok(StageResult::escalate(e)),
        };

        let verdict: ReviewVerdict =
            match serde_json::from_str(plan::extract_json_block(&response.output)) {
                Ok(v) => v,
                Err(e) => {
                    return Ok(StageResult::retry(EngineError::transient(format!(
                        "Unparsable plan review verdict: {}",
                        e
                    ))));
                }
            };

        if verdict.approve {
            Ok(StageResult::success(Stage::Approval)
                .with_side_effects(SideEffects::default().comment("Plan review passed.")))
        } else {
            let effects = SideEffects::default().comment(format!(
                "Plan review rejected revision {}:\n{}",
                current.revision,
                verdict
                    .reasons
                    .iter()
                    .map(|r| format!("- {}", r))
                    .collect::<Vec<_>>()
                    .join("\n")
            ));
            Ok(StageResult::success(Stage::Planning).with_side_effects(effects))
        }
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Human gate: proceed only when the approval label is present on the item.
struct ApprovalHandler;

#[async_trait]
impl StageHandler for ApprovalHandler {
    fn stage(&self) -> Stage {
        Stage::Approval
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let current_labels = match ctx.git.list_labels(&ctx.item.id).await {
            Ok(l) => l,
            Err(e) if e.is_retryable() => return Ok(StageResult::retry(e)),
            Err(e) => return Ok(StageResult::escalate(e)),
        };

        if current_labels.contains(&ctx.config.labels.approved) {
            Ok(StageResult::success(Stage::Implementation).with_side_effects(
                SideEffects::default().comment("Plan approved, starting implementation."),
            ))
        } else {
            // Not an error in the item: the engine pauses until a human
            // applies the label and re-triggers.
            Ok(StageResult::escalate(EngineError::ManualInterventionRequired {
                reason: format!(
                    "Waiting for the '{}' label before implementation",
                    ctx.config.labels.approved
                ),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Implementation
// ---------------------------------------------------------------------------

/// Runs the agent for one task on its branch.
struct AgentTaskRunner {
    item_id: String,
    item_title: String,
    item_branch: String,
    branch_strategy: BranchStrategy,
    git: Arc<dyn GitProvider>,
    agent: Arc<dyn AgentProvider>,
}

#[async_trait]
impl TaskRunner for AgentTaskRunner {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> EngineResult<TaskResult> {
        if cancel.is_cancelled() {
            return Err(EngineError::transient("Task interrupted by shutdown"));
        }

        let branch = match self.branch_strategy {
            BranchStrategy::BranchPerTask => {
                format!("foreman/item-{}-{}", self.item_id, task.task_id)
            }
            BranchStrategy::SingleBranch => self.item_branch.clone(),
        };
        let branch_ref = self.git.create_branch(&branch).await?;

        let prompt = format!(
            "Implement the following task on branch '{}' for the change '{}'.\n\
             Commit your work to that branch when done.\n\nTask {}: {}",
            branch_ref, self.item_title, task.task_id, task.description
        );
        self.agent.generate(AgentRequest::new(prompt)).await?;

        Ok(TaskResult::Branch { branch_ref })
    }
}

/// Execute the plan's tasks through the parallel executor and open a pull
/// request when every task succeeds.
struct ImplementationHandler;

#[async_trait]
impl StageHandler for ImplementationHandler {
    fn stage(&self) -> Stage {
        Stage::Implementation
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let Some(current) = &ctx.plan else {
            return Ok(StageResult::escalate(EngineError::ManualInterventionRequired {
                reason: "Implementation reached without a plan".to_string(),
            }));
        };

        let runner = Arc::new(AgentTaskRunner {
            item_id: ctx.item.id.clone(),
            item_title: ctx.remote.title.clone(),
            item_branch: ctx.item_branch(),
            branch_strategy: current.branch_strategy,
            git: ctx.git.clone(),
            agent: ctx.agent.clone(),
        });

        let executor = ParallelExecutor::new(ExecutorConfig {
            max_concurrency: ctx.config.engine.max_parallel_tasks,
            task_timeout: ctx.config.engine.task_timeout(),
        });

        // A re-entered round re-attempts tasks that failed last time, keeping
        // their attempt counts; succeeded tasks stay done.
        let mut tasks = current.tasks.clone();
        for task in &mut tasks {
            if task.status == TaskStatus::Failed {
                task.status = TaskStatus::Blocked;
                task.result = None;
            }
        }

        // Cycle validation happens inside; checkpointed successes are
        // restored and never re-dispatched.
        let outcome = match executor.run(tasks, runner, ctx.cancel.clone()).await {
            Ok(o) => o,
            Err(e @ EngineError::DependencyCycle { .. }) => return Ok(StageResult::fatal(e)),
            Err(e) => return Err(e),
        };

        let mut updated = current.clone();
        updated.tasks = outcome.tasks.clone();

        if outcome.cancelled {
            return Ok(StageResult::retry(EngineError::transient(
                "Plan execution interrupted by shutdown",
            ))
            .with_plan(updated));
        }

        if !outcome.success {
            let detail = outcome
                .tasks
                .iter()
                .filter_map(|t| match &t.result {
                    Some(TaskResult::Error { detail }) => {
                        Some(format!("{}: {}", t.task_id, detail))
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(StageResult::retry(EngineError::transient(format!(
                "{} task(s) failed: {}",
                outcome.failed.len(),
                detail
            )))
            .with_plan(updated));
        }

        // Open the pull request once; a resumed run reuses the recorded id.
        let pr_id = match &ctx.item.pr_id {
            Some(id) => id.clone(),
            None => {
                let spec = PullRequestSpec {
                    title: ctx.remote.title.clone(),
                    body: format!(
                        "Automated implementation for #{}.\n\n{}",
                        ctx.item.id,
                        plan_summary(&updated)
                    ),
                    head: ctx.item_branch(),
                    base: String::new(),
                };
                match ctx.git.create_pull_request(&spec).await {
                    Ok(id) => id,
                    Err(e) if e.is_retryable() => {
                        return Ok(StageResult::retry(e).with_plan(updated));
                    }
                    Err(e) => return Ok(StageResult::escalate(e).with_plan(updated)),
                }
            }
        };

        info!(item = %ctx.item.id, pr = %pr_id, "Implementation complete");

        Ok(StageResult::success(Stage::CodeReview)
            .with_plan(updated)
            .with_patch(ItemPatch { pr_id: Some(pr_id) })
            .with_side_effects(
                SideEffects::default().comment("All tasks implemented, pull request opened."),
            ))
    }
}

// ---------------------------------------------------------------------------
// CodeReview
// ---------------------------------------------------------------------------

/// Agent review of the implemented change. A `fix` verdict routes to the Fix
/// stage with the findings attached; a `pass` verdict proceeds to QA.
struct CodeReviewHandler;

#[async_trait]
impl StageHandler for CodeReviewHandler {
    fn stage(&self) -> Stage {
        Stage::CodeReview
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let prompt = format!(
            "Review the changes on branch '{}' (pull request {}) for the change '{}'.\n\
             Look for correctness bugs, missing error handling, and contract violations.\n\
             Respond with JSON only: {{\"approve\": true|false, \"reasons\": [\"...\"]}}.",
            ctx.item_branch(),
            ctx.item.pr_id.as_deref().unwrap_or("-"),
            ctx.remote.title
        );

        let response = match ctx.agent.generate(AgentRequest::new(prompt)).await {
            Ok(r) => r,
            Err(e) if e.is_retryable() => return Ok(StageResult::retry(e)),
            Err(e) => return Ok(StageResult::escalate(e)),
        };

        let verdict: ReviewVerdict =
            match serde_json::from_str(plan::extract_json_block(&response.output)) {
                Ok(v) => v,
                Err(e) => {
                    return Ok(StageResult::retry(EngineError::transient(format!(
                        "Unparsable code review verdict: {}",
                        e
                    ))));
                }
            };

        if verdict.approve {
            Ok(StageResult::success(Stage::Qa)
                .with_side_effects(SideEffects::default().comment("Code review passed.")))
        } else {
            let findings = verdict
                .reasons
                .iter()
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(StageResult::success(Stage::Fix).with_side_effects(
                SideEffects::default()
                    .comment(format!("Code review requested fixes:\n{}", findings)),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Qa
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct QaReport {
    passed: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    output: String,
}

/// Run verification on the integrated change. A failure is a `TestFailure`
/// so the recovery manager can route it through the test-fix strategy.
struct QaHandler;

#[async_trait]
impl StageHandler for QaHandler {
    fn stage(&self) -> Stage {
        Stage::Qa
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let prompt = format!(
            "Run the full test suite on branch '{}' and report the result.\n\
             Respond with JSON only: {{\"passed\": true|false, \"summary\": \"...\", \"output\": \"...\"}}.",
            ctx.item_branch()
        );

        let response = match ctx.agent.generate(AgentRequest::new(prompt)).await {
            Ok(r) => r,
            Err(e) if e.is_retryable() => return Ok(StageResult::retry(e)),
            Err(e) => return Ok(StageResult::escalate(e)),
        };

        let report: QaReport = match serde_json::from_str(plan::extract_json_block(&response.output))
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(StageResult::retry(EngineError::transient(format!(
                    "Unparsable QA report: {}",
                    e
                ))));
            }
        };

        if report.passed {
            Ok(StageResult::success(Stage::Merge)
                .with_side_effects(SideEffects::default().comment("QA passed.")))
        } else {
            Ok(StageResult::retry(EngineError::TestFailure {
                summary: report.summary,
                output: report.output,
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Fix
// ---------------------------------------------------------------------------

/// Prepare a targeted re-entry into Implementation.
///
/// Failed tasks are reset for re-dispatch; when every task succeeded (the
/// findings came from review or QA rather than a task failure) a fix task
/// carrying the findings is appended as a new plan revision. Succeeded tasks
/// are never re-run either way.
struct FixHandler;

#[async_trait]
impl StageHandler for FixHandler {
    fn stage(&self) -> Stage {
        Stage::Fix
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let Some(current) = &ctx.plan else {
            return Ok(StageResult::escalate(EngineError::ManualInterventionRequired {
                reason: "Fix reached without a plan".to_string(),
            }));
        };

        let mut updated = current.clone();
        let mut reset = 0;
        for task in &mut updated.tasks {
            if task.status == TaskStatus::Failed {
                task.status = TaskStatus::Blocked;
                task.result = None;
                reset += 1;
            }
        }

        if reset == 0 {
            // Nothing failed at the task level: append a fix task for the
            // attached findings. Topology change requires a new revision.
            let context = ctx
                .fix_context
                .clone()
                .unwrap_or_else(|| "Address the review findings on this change.".to_string());
            let fix_id = format!("fix-{}", updated.revision + 1);
            updated.tasks.push(Task::new(&fix_id, &context, Vec::new()));
            updated.revision += 1;
            info!(item = %ctx.item.id, task = %fix_id, "Appended fix task");
        } else {
            info!(item = %ctx.item.id, reset, "Reset failed tasks for re-dispatch");
        }

        Ok(StageResult::success(Stage::Implementation).with_plan(updated))
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge the pull request and close out the item.
struct MergeHandler;

#[async_trait]
impl StageHandler for MergeHandler {
    fn stage(&self) -> Stage {
        Stage::Merge
    }

    async fn execute(&self, ctx: &StageContext) -> EngineResult<StageResult> {
        let Some(pr_id) = &ctx.item.pr_id else {
            return Ok(StageResult::escalate(EngineError::ManualInterventionRequired {
                reason: "Merge reached without a recorded pull request".to_string(),
            }));
        };

        match ctx.git.merge_pull_request(pr_id).await {
            Ok(()) => {
                let effects = SideEffects::default()
                    .remove_label(labels::PROPOSED)
                    .add_label(labels::MERGED)
                    .comment(format!("Pull request {} merged.", pr_id));
                Ok(StageResult::success(Stage::Completed).with_side_effects(effects))
            }
            Err(e @ EngineError::MergeConflict(_)) => Ok(StageResult::retry(e)),
            Err(e) if e.is_retryable() => Ok(StageResult::retry(e)),
            Err(e) => Ok(StageResult::escalate(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::AgentResponse;
    use std::sync::Mutex;

    /// Agent stub returning canned responses in order.
    struct ScriptedAgent {
        responses: Mutex<Vec<EngineResult<AgentResponse>>>,
    }

    impl ScriptedAgent {
        fn new(responses: Vec<EngineResult<AgentResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }

        fn ok(output: &str) -> EngineResult<AgentResponse> {
            Ok(AgentResponse {
                output: output.to_string(),
            })
        }
    }

    #[async_trait]
    impl AgentProvider for ScriptedAgent {
        async fn generate(&self, _request: AgentRequest) -> EngineResult<AgentResponse> {
            self.responses
                .lock()
                .unwrap()
                .remove(0)
        }
    }

    /// Git stub recording label/comment calls.
    #[derive(Default)]
    struct StubGit {
        labels: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GitProvider for StubGit {
        async fn get_item(&self, id: &str) -> EngineResult<RemoteItem> {
            Ok(RemoteItem {
                id: id.to_string(),
                title: "Add widgets".to_string(),
                body: String::new(),
                labels: self.labels.lock().unwrap().clone(),
            })
        }

        async fn list_labels(&self, _id: &str) -> EngineResult<Vec<String>> {
            Ok(self.labels.lock().unwrap().clone())
        }

        async fn add_label(&self, _id: &str, label: &str) -> EngineResult<()> {
            self.labels.lock().unwrap().push(label.to_string());
            Ok(())
        }

        async fn remove_label(&self, _id: &str, label: &str) -> EngineResult<()> {
            self.labels.lock().unwrap().retain(|l| l != label);
            Ok(())
        }

        async fn post_comment(&self, _id: &str, _text: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn create_branch(&self, name: &str) -> EngineResult<String> {
            Ok(name.to_string())
        }

        async fn create_pull_request(&self, _spec: &PullRequestSpec) -> EngineResult<String> {
            Ok("7".to_string())
        }

        async fn merge_pull_request(&self, _id: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn list_triggered(&self, _label: &str) -> EngineResult<Vec<RemoteItem>> {
            Ok(Vec::new())
        }
    }

    fn context(agent: ScriptedAgent, plan: Option<Plan>) -> StageContext {
        StageContext {
            item: WorkflowItem::new("42", vec![]),
            remote: RemoteItem {
                id: "42".to_string(),
                title: "Add widgets".to_string(),
                body: "We need widgets.".to_string(),
                labels: vec![],
            },
            plan,
            fix_context: None,
            git: Arc::new(StubGit::default()),
            agent: Arc::new(agent),
            config: Arc::new(ForemanConfig::default()),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn planning_success_declares_label_swap() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok(
            r#"{"tasks": [{"id": "t1", "description": "make widget", "depends_on": []}]}"#,
        )]);
        let ctx = context(agent, None);

        let result = PlanningHandler.execute(&ctx).await.unwrap();

        assert_eq!(result.outcome, crate::pipeline::StageOutcome::Success);
        assert_eq!(result.next_stage, Some(Stage::PlanReview));
        assert_eq!(result.side_effects.remove_labels, vec!["needs-planning"]);
        assert_eq!(result.side_effects.add_labels, vec!["proposed"]);
        assert_eq!(result.plan.as_ref().unwrap().tasks.len(), 1);
    }

    #[tokio::test]
    async fn planning_cyclic_plan_is_fatal() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok(
            r#"{"tasks": [
                {"id": "a", "description": "x", "depends_on": ["b"]},
                {"id": "b", "description": "y", "depends_on": ["a"]}
            ]}"#,
        )]);
        let ctx = context(agent, None);

        let result = PlanningHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.outcome, crate::pipeline::StageOutcome::Fatal);
        assert!(matches!(result.error, Some(EngineError::DependencyCycle { .. })));
    }

    #[tokio::test]
    async fn replan_bumps_the_revision() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok(
            r#"{"tasks": [{"id": "t1", "description": "redo", "depends_on": []}]}"#,
        )]);
        let prior = Plan::new(vec![Task::new("t1", "old", vec![])], BranchStrategy::default());
        let ctx = context(agent, Some(prior));

        let result = PlanningHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.plan.unwrap().revision, 2);
    }

    #[tokio::test]
    async fn plan_review_rejection_loops_to_planning() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok(
            r#"{"approve": false, "reasons": ["t1 is too broad"]}"#,
        )]);
        let plan = Plan::new(vec![Task::new("t1", "everything", vec![])], BranchStrategy::default());
        let ctx = context(agent, Some(plan));

        let result = PlanReviewHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.next_stage, Some(Stage::Planning));
        assert!(result.side_effects.comments[0].contains("too broad"));
    }

    #[tokio::test]
    async fn approval_without_label_escalates() {
        let agent = ScriptedAgent::new(vec![]);
        let ctx = context(agent, None);

        let result = ApprovalHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.outcome, crate::pipeline::StageOutcome::Escalate);
        assert!(matches!(
            result.error,
            Some(EngineError::ManualInterventionRequired { .. })
        ));
    }

    #[tokio::test]
    async fn approval_with_label_proceeds() {
        let agent = ScriptedAgent::new(vec![]);
        let mut ctx = context(agent, None);
        let git = StubGit::default();
        git.labels.lock().unwrap().push("approved".to_string());
        ctx.git = Arc::new(git);

        let result = ApprovalHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.next_stage, Some(Stage::Implementation));
    }

    #[tokio::test]
    async fn implementation_runs_tasks_and_opens_pr() {
        // One agent call per task
        let agent = ScriptedAgent::new(vec![
            ScriptedAgent::ok("done"),
            ScriptedAgent::ok("done"),
        ]);
        let plan = Plan::new(
            vec![
                Task::new("t1", "a", vec![]),
                Task::new("t2", "b", vec!["t1".to_string()]),
            ],
            BranchStrategy::SingleBranch,
        );
        let ctx = context(agent, Some(plan));

        let result = ImplementationHandler.execute(&ctx).await.unwrap();

        assert_eq!(result.next_stage, Some(Stage::CodeReview));
        assert_eq!(result.patch.pr_id.as_deref(), Some("7"));
        let updated = result.plan.unwrap();
        assert!(updated.tasks.iter().all(|t| t.status == TaskStatus::Succeeded));
    }

    #[tokio::test]
    async fn implementation_failure_retries_with_partial_plan() {
        let agent = ScriptedAgent::new(vec![
            Err(EngineError::transient("rate limited")),
        ]);
        let plan = Plan::new(vec![Task::new("t1", "a", vec![])], BranchStrategy::SingleBranch);
        let ctx = context(agent, Some(plan));

        let result = ImplementationHandler.execute(&ctx).await.unwrap();

        assert_eq!(result.outcome, crate::pipeline::StageOutcome::Retry);
        let updated = result.plan.unwrap();
        assert_eq!(updated.task("t1").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn implementation_reentry_reruns_only_failed_tasks() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok("done")]);
        let mut plan = Plan::new(
            vec![Task::new("t1", "a", vec![]), Task::new("t2", "b", vec![])],
            BranchStrategy::SingleBranch,
        );
        plan.task_mut("t1").unwrap().status = TaskStatus::Failed;
        plan.task_mut("t1").unwrap().attempts = 1;
        plan.task_mut("t2").unwrap().status = TaskStatus::Succeeded;
        plan.task_mut("t2").unwrap().attempts = 1;
        let mut ctx = context(agent, Some(plan));
        ctx.item.pr_id = Some("7".to_string());

        let result = ImplementationHandler.execute(&ctx).await.unwrap();

        assert_eq!(result.next_stage, Some(Stage::CodeReview));
        let updated = result.plan.unwrap();
        assert_eq!(updated.task("t1").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(updated.task("t1").unwrap().attempts, 2);
        assert_eq!(updated.task("t2").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn code_review_fix_verdict_routes_to_fix() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok(
            r#"{"approve": false, "reasons": ["missing error handling"]}"#,
        )]);
        let ctx = context(agent, None);

        let result = CodeReviewHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.next_stage, Some(Stage::Fix));
    }

    #[tokio::test]
    async fn qa_failure_is_a_test_failure_retry() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::ok(
            r#"{"passed": false, "summary": "2 failed", "output": "assert!"}"#,
        )]);
        let ctx = context(agent, None);

        let result = QaHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.outcome, crate::pipeline::StageOutcome::Retry);
        assert!(matches!(result.error, Some(EngineError::TestFailure { .. })));
    }

    #[tokio::test]
    async fn fix_resets_failed_tasks_only() {
        let agent = ScriptedAgent::new(vec![]);
        let mut plan = Plan::new(
            vec![Task::new("t1", "a", vec![]), Task::new("t2", "b", vec![])],
            BranchStrategy::default(),
        );
        plan.task_mut("t1").unwrap().status = TaskStatus::Succeeded;
        plan.task_mut("t2").unwrap().status = TaskStatus::Failed;
        let revision = plan.revision;
        let ctx = context(agent, Some(plan));

        let result = FixHandler.execute(&ctx).await.unwrap();
        let updated = result.plan.unwrap();

        assert_eq!(updated.task("t1").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(updated.task("t2").unwrap().status, TaskStatus::Blocked);
        // No topology change, no revision bump
        assert_eq!(updated.revision, revision);
    }

    #[tokio::test]
    async fn fix_appends_task_when_nothing_failed() {
        let agent = ScriptedAgent::new(vec![]);
        let mut plan = Plan::new(vec![Task::new("t1", "a", vec![])], BranchStrategy::default());
        plan.task_mut("t1").unwrap().status = TaskStatus::Succeeded;
        let ctx = StageContext {
            fix_context: Some("tests failed: widget overflow".to_string()),
            ..context(agent, Some(plan))
        };

        let result = FixHandler.execute(&ctx).await.unwrap();
        let updated = result.plan.unwrap();

        assert_eq!(updated.tasks.len(), 2);
        assert_eq!(updated.revision, 2);
        assert!(updated.tasks[1].description.contains("widget overflow"));
    }

    #[tokio::test]
    async fn merge_without_pr_escalates() {
        let agent = ScriptedAgent::new(vec![]);
        let ctx = context(agent, None);

        let result = MergeHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.outcome, crate::pipeline::StageOutcome::Escalate);
    }

    #[tokio::test]
    async fn merge_success_completes_the_item() {
        let agent = ScriptedAgent::new(vec![]);
        let mut ctx = context(agent, None);
        ctx.item.pr_id = Some("7".to_string());

        let result = MergeHandler.execute(&ctx).await.unwrap();
        assert_eq!(result.next_stage, Some(Stage::Completed));
        assert!(result.side_effects.add_labels.contains(&"merged".to_string()));
    }

    #[test]
    fn registry_covers_every_executable_stage() {
        let registry = StageRegistry::standard();
        for stage in [
            Stage::Planning,
            Stage::PlanReview,
            Stage::Approval,
            Stage::Implementation,
            Stage::CodeReview,
            Stage::Qa,
            Stage::Fix,
            Stage::Merge,
        ] {
            assert!(registry.handler_for(stage).is_some(), "missing handler for {}", stage);
        }
        for stage in [Stage::Completed, Stage::Failed, Stage::AwaitingHuman] {
            assert!(registry.handler_for(stage).is_none());
        }
    }
}
