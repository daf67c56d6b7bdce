//! Lifecycle stage machine.
//!
//! Stages form a closed state machine:
//!
//! ```text
//! Planning -> PlanReview -> Approval -> Implementation -> CodeReview -> Qa -> Merge -> Completed
//!                                            ^                |
//!                                            +----- Fix <-----+
//! ```
//!
//! `Failed` and `AwaitingHuman` are reachable from any stage once recovery is
//! exhausted. Each stage handler is a pure contract: it reads item/plan state
//! and collaborators and produces a `StageResult`; all external mutation
//! (labels, comments, git refs) goes through the declared `SideEffects`,
//! applied by the orchestrator — the single writer of record.

mod handlers;

pub use handlers::{StageContext, StageHandler, StageRegistry, labels};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// One phase of the change lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    PlanReview,
    Approval,
    Implementation,
    CodeReview,
    Qa,
    Fix,
    Merge,
    Completed,
    Failed,
    AwaitingHuman,
}

impl Stage {
    /// Stable string key used in the database and in retry counters.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::PlanReview => "plan_review",
            Self::Approval => "approval",
            Self::Implementation => "implementation",
            Self::CodeReview => "code_review",
            Self::Qa => "qa",
            Self::Fix => "fix",
            Self::Merge => "merge",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingHuman => "awaiting_human",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "planning" => Some(Self::Planning),
            "plan_review" => Some(Self::PlanReview),
            "approval" => Some(Self::Approval),
            "implementation" => Some(Self::Implementation),
            "code_review" => Some(Self::CodeReview),
            "qa" => Some(Self::Qa),
            "fix" => Some(Self::Fix),
            "merge" => Some(Self::Merge),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "awaiting_human" => Some(Self::AwaitingHuman),
            _ => None,
        }
    }

    /// Terminal stages have no handler and are never executed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::AwaitingHuman)
    }

    /// The stage a `Success` outcome advances to when the handler does not
    /// choose one of the allowed alternatives itself.
    pub fn default_next(&self) -> Option<Stage> {
        match self {
            Self::Planning => Some(Self::PlanReview),
            Self::PlanReview => Some(Self::Approval),
            Self::Approval => Some(Self::Implementation),
            Self::Implementation => Some(Self::CodeReview),
            Self::CodeReview => Some(Self::Qa),
            Self::Qa => Some(Self::Merge),
            Self::Fix => Some(Self::Implementation),
            Self::Merge => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::AwaitingHuman => None,
        }
    }

    /// Stages a `Success` outcome from this stage may legally advance to.
    pub fn allowed_successors(&self) -> &'static [Stage] {
        match self {
            Self::Planning => &[Stage::PlanReview],
            Self::PlanReview => &[Stage::Approval, Stage::Planning],
            Self::Approval => &[Stage::Implementation],
            Self::Implementation => &[Stage::CodeReview],
            Self::CodeReview => &[Stage::Qa, Stage::Fix],
            Self::Qa => &[Stage::Merge, Stage::Fix],
            Self::Fix => &[Stage::Implementation],
            Self::Merge => &[Stage::Completed],
            Self::Completed | Self::Failed | Self::AwaitingHuman => &[],
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// How a stage execution concluded. Control flow is data: the orchestrator
/// matches on this instead of catching exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage finished; advance to `StageResult::next_stage`
    Success,
    /// Transient problem; the recovery manager schedules another attempt
    Retry,
    /// The stage cannot make progress without help; consult recovery
    Escalate,
    /// Unrecoverable; the item is marked failed
    Fatal,
}

impl StageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retry => "retry",
            Self::Escalate => "escalate",
            Self::Fatal => "fatal",
        }
    }
}

/// Labels and comments a stage wants applied. Declared, not executed: the
/// orchestrator is the only component that talks to the git host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideEffects {
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub comments: Vec<String>,
}

impl SideEffects {
    pub fn is_empty(&self) -> bool {
        self.add_labels.is_empty() && self.remove_labels.is_empty() && self.comments.is_empty()
    }

    pub fn add_label(mut self, label: impl Into<String>) -> Self {
        self.add_labels.push(label.into());
        self
    }

    pub fn remove_label(mut self, label: impl Into<String>) -> Self {
        self.remove_labels.push(label.into());
        self
    }

    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comments.push(text.into());
        self
    }
}

/// Fields a stage may set on the workflow item, applied by the orchestrator
/// in the same versioned update that advances the stage.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    /// Pull request id recorded after Implementation opens one
    pub pr_id: Option<String>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.pr_id.is_none()
    }
}

/// Outcome of one stage execution.
#[derive(Debug)]
pub struct StageResult {
    pub outcome: StageOutcome,
    /// Set when `outcome` is `Success`
    pub next_stage: Option<Stage>,
    pub side_effects: SideEffects,
    /// Set when `outcome` is not `Success`
    pub error: Option<EngineError>,
    /// Updated plan state for the orchestrator to checkpoint
    pub plan: Option<crate::plan::Plan>,
    /// Item fields to persist alongside the stage transition
    pub patch: ItemPatch,
}

impl StageResult {
    pub fn success(next_stage: Stage) -> Self {
        Self {
            outcome: StageOutcome::Success,
            next_stage: Some(next_stage),
            side_effects: SideEffects::default(),
            error: None,
            plan: None,
            patch: ItemPatch::default(),
        }
    }

    pub fn retry(error: EngineError) -> Self {
        Self {
            outcome: StageOutcome::Retry,
            next_stage: None,
            side_effects: SideEffects::default(),
            error: Some(error),
            plan: None,
            patch: ItemPatch::default(),
        }
    }

    pub fn escalate(error: EngineError) -> Self {
        Self {
            outcome: StageOutcome::Escalate,
            next_stage: None,
            side_effects: SideEffects::default(),
            error: Some(error),
            plan: None,
            patch: ItemPatch::default(),
        }
    }

    pub fn fatal(error: EngineError) -> Self {
        Self {
            outcome: StageOutcome::Fatal,
            next_stage: None,
            side_effects: SideEffects::default(),
            error: Some(error),
            plan: None,
            patch: ItemPatch::default(),
        }
    }

    pub fn with_side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = side_effects;
        self
    }

    pub fn with_plan(mut self, plan: crate::plan::Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_patch(mut self, patch: ItemPatch) -> Self {
        self.patch = patch;
        self
    }
}

/// Resolve the stage a successful result advances to, enforcing the
/// transition table. A handler returning a stage outside its row is a bug
/// surfaced as a fatal error rather than a silent bad transition.
pub fn resolve_transition(current: Stage, result: &StageResult) -> Result<Stage, EngineError> {
    debug_assert_eq!(result.outcome, StageOutcome::Success);

    let next = result
        .next_stage
        .or_else(|| current.default_next())
        .ok_or_else(|| {
            EngineError::Other(anyhow::anyhow!(
                "Stage {} has no successor to advance to",
                current
            ))
        })?;

    if !current.allowed_successors().contains(&next) {
        return Err(EngineError::Other(anyhow::anyhow!(
            "Illegal transition {} -> {}",
            current,
            next
        )));
    }

    Ok(next)
}
