//! The composition root: ties stages, recovery, the store, and the
//! collaborators together.
//!
//! `process` performs exactly one stage step for one trigger. Per-item async
//! locks serialize triggers for the same id; different items proceed fully in
//! parallel. After every stage execution the orchestrator checkpoints, applies
//! declared side effects, and persists the new item state through the
//! versioned store — an item is never left without an observable state change.

mod daemon;

pub use daemon::{DaemonContext, run_daemon};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ForemanConfig;
use crate::errors::{EngineError, EngineResult};
use crate::item::{ItemStatus, WorkflowItem};
use crate::pipeline::{
    SideEffects, Stage, StageContext, StageOutcome, StageRegistry, StageResult, resolve_transition,
};
use crate::plan::Plan;
use crate::providers::{AgentProvider, AgentRequest, GitProvider};
use crate::recovery::{ErrorKind, RecoveryManager, classify};
use crate::store::{CheckpointManager, CheckpointPayload, StateStore};

/// An external trigger event: an item id plus the label event that fired.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub item_id: String,
    pub event_label: String,
}

impl Trigger {
    pub fn new(item_id: impl Into<String>, event_label: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            event_label: event_label.into(),
        }
    }
}

/// What one `process` call did.
#[derive(Debug, Clone)]
pub struct ProcessingSummary {
    pub item_id: String,
    pub stage_before: Stage,
    pub stage_after: Stage,
    pub status: ItemStatus,
    /// Stage outcome, a recovery strategy, or "skipped"/"deferred"
    pub outcome: String,
    pub checkpoint_seq: Option<u64>,
}

/// The workflow orchestration engine.
pub struct Orchestrator {
    store: StateStore,
    checkpoints: CheckpointManager,
    git: Arc<dyn GitProvider>,
    agent: Arc<dyn AgentProvider>,
    registry: StageRegistry,
    recovery: RecoveryManager,
    config: Arc<ForemanConfig>,
    /// Per-item locks serializing triggers for the same id
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        checkpoints: CheckpointManager,
        git: Arc<dyn GitProvider>,
        agent: Arc<dyn AgentProvider>,
        config: Arc<ForemanConfig>,
    ) -> Self {
        let recovery = RecoveryManager::new(&config.recovery);
        Self {
            store,
            checkpoints,
            git,
            agent,
            registry: StageRegistry::standard(),
            recovery,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn git(&self) -> &Arc<dyn GitProvider> {
        &self.git
    }

    async fn item_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Process one trigger: load or create the item, run its current stage
    /// once, persist the outcome. Duplicate triggers for a terminal item are
    /// no-ops; backoff deferrals are respected.
    pub async fn process(
        &self,
        trigger: Trigger,
        cancel: CancellationToken,
    ) -> EngineResult<ProcessingSummary> {
        let lock = self.item_lock(&trigger.item_id).await;
        let _guard = lock.lock().await;

        let mut item = self.load_or_create(&trigger).await?;
        let stage_before = item.current_stage;

        // Terminal items are never touched again.
        if item.status.is_terminal() {
            return Ok(summary_noop(&item, stage_before, "skipped"));
        }

        // Retry backoff: not yet eligible.
        if let Some(not_before) = item.not_before
            && not_before > Utc::now()
        {
            return Ok(summary_noop(&item, stage_before, "deferred"));
        }

        // A re-trigger wakes an awaiting-human item back into the stage that
        // escalated, recorded by the latest checkpoint.
        if item.current_stage == Stage::AwaitingHuman {
            let resume_stage = self
                .checkpoints
                .latest(&item.id)
                .await?
                .map(|cp| cp.stage)
                .unwrap_or(Stage::Planning);
            info!(item = %item.id, stage = %resume_stage, "Re-triggered from awaiting-human");
            item = self
                .persist(&item.id, item.version, move |i| {
                    i.current_stage = resume_stage;
                    i.status = ItemStatus::InProgress;
                })
                .await?;
            self.apply_side_effects(
                &item.id,
                &SideEffects::default().remove_label(self.config.labels.needs_human.clone()),
            )
            .await;
        }

        let stage = item.current_stage;
        let Some(handler) = self.registry.handler_for(stage) else {
            return Ok(summary_noop(&item, stage_before, "skipped"));
        };

        // Mark in progress and refresh the label snapshot before running.
        let remote = self.git.get_item(&item.id).await?;
        let remote_labels = remote.labels.clone();
        item = self
            .persist(&item.id, item.version, move |i| {
                i.status = ItemStatus::InProgress;
                i.labels_snapshot = remote_labels.clone();
                i.not_before = None;
            })
            .await?;

        let ctx = StageContext {
            item: item.clone(),
            remote,
            plan: self.latest_plan(&item.id).await?,
            fix_context: self.latest_fix_context(&item.id).await?,
            git: self.git.clone(),
            agent: self.agent.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };

        info!(item = %item.id, stage = %stage, "Executing stage");

        let result = match tokio::time::timeout(
            self.config.engine.stage_timeout(),
            handler.execute(&ctx),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_retryable() => StageResult::retry(e),
            Ok(Err(e)) => StageResult::escalate(e),
            Err(_) => StageResult::retry(EngineError::StageTimeout {
                stage: stage.key().to_string(),
                elapsed_secs: self.config.engine.stage_timeout_secs,
            }),
        };

        // Plan state changed during the stage: checkpoint it first so a crash
        // between here and the item update never loses task progress.
        if let Some(plan) = &result.plan {
            self.checkpoints
                .checkpoint(
                    &item.id,
                    stage,
                    CheckpointPayload::PlanSnapshot { plan: plan.clone() },
                )
                .await?;
        }

        match result.outcome {
            StageOutcome::Success => self.handle_success(item, stage, result).await,
            StageOutcome::Retry | StageOutcome::Escalate => {
                self.handle_failure(item, stage, result).await
            }
            StageOutcome::Fatal => self.handle_fatal(item, stage, result).await,
        }
    }

    async fn handle_success(
        &self,
        item: WorkflowItem,
        stage: Stage,
        result: StageResult,
    ) -> EngineResult<ProcessingSummary> {
        let next = match resolve_transition(stage, &result) {
            Ok(next) => next,
            Err(e) => {
                return self.handle_fatal(item, stage, StageResult::fatal(e)).await;
            }
        };

        self.apply_side_effects(&item.id, &result.side_effects).await;

        let seq = self
            .checkpoints
            .checkpoint(
                &item.id,
                stage,
                CheckpointPayload::StageOutcome {
                    outcome: StageOutcome::Success.as_str().to_string(),
                    next_stage: Some(next),
                    error: None,
                },
            )
            .await?;

        let patch_pr = result.patch.pr_id.clone();
        let updated = self
            .persist(&item.id, item.version, move |i| {
                if let Some(pr_id) = &patch_pr {
                    i.pr_id = Some(pr_id.clone());
                }
                i.advance_to(next);
            })
            .await?;

        if updated.status.is_terminal() {
            self.store.archive(&updated.id).await?;
            info!(item = %updated.id, "Item archived");
        }

        info!(item = %updated.id, from = %stage, to = %next, "Stage advanced");

        Ok(ProcessingSummary {
            item_id: updated.id.clone(),
            stage_before: stage,
            stage_after: next,
            status: updated.status,
            outcome: StageOutcome::Success.as_str().to_string(),
            checkpoint_seq: Some(seq),
        })
    }

    async fn handle_failure(
        &self,
        item: WorkflowItem,
        stage: Stage,
        result: StageResult,
    ) -> EngineResult<ProcessingSummary> {
        let error = result.error.unwrap_or_else(|| {
            EngineError::Other(anyhow::anyhow!("Stage reported failure without an error"))
        });
        let kind = classify(&error);

        // TestFailure rounds are bounded by the separate fix counter; plain
        // retries by the per-stage counter. The attempt being recorded now is
        // included in the count the bound check sees.
        let attempts = if kind == ErrorKind::TestFailure {
            item.fix_attempts + 1
        } else {
            item.attempts_for(stage) + 1
        };

        let decision = self.recovery.select(kind, attempts);

        warn!(
            item = %item.id, stage = %stage, kind = kind.as_str(),
            attempts, strategy = decision.strategy, "Stage failed"
        );

        let fix_context = match &error {
            EngineError::TestFailure { output, .. } => Some(output.clone()),
            _ => None,
        };

        let seq = self
            .checkpoints
            .checkpoint(
                &item.id,
                stage,
                CheckpointPayload::RecoveryDecision {
                    strategy: decision.strategy.to_string(),
                    delay_secs: decision.next_attempt_delay.as_secs(),
                    escalate: decision.escalate,
                    context: fix_context,
                },
            )
            .await?;

        if decision.escalate {
            let updated = self
                .persist(&item.id, item.version, move |i| {
                    i.record_attempt(stage);
                    i.current_stage = Stage::AwaitingHuman;
                    i.status = ItemStatus::AwaitingHuman;
                })
                .await?;

            let effects = SideEffects::default()
                .add_label(self.config.labels.needs_human.clone())
                .comment(format!(
                    "Automation paused at stage `{}`: {}\nResolve the problem and re-trigger to resume.",
                    stage, error
                ));
            self.apply_side_effects(&item.id, &effects).await;

            return Ok(ProcessingSummary {
                item_id: updated.id.clone(),
                stage_before: stage,
                stage_after: Stage::AwaitingHuman,
                status: updated.status,
                outcome: format!("recovery:{}", decision.strategy),
                checkpoint_seq: Some(seq),
            });
        }

        // Conflict resolution runs an automated rebase pass before the stage
        // is re-entered.
        if decision.strategy == "conflict_resolution" {
            let prompt = format!(
                "Rebase branch 'foreman/item-{}' onto the default branch and resolve any \
                 merge conflicts, preserving both sides' intent. Commit the result.",
                item.id
            );
            if let Err(e) = self.agent.generate(AgentRequest::new(prompt)).await {
                warn!(item = %item.id, error = %e, "Conflict resolution pass failed");
            }
        }

        let delay = decision.next_attempt_delay;
        let next_stage = if decision.strategy == "test_fix" {
            // Route back into Implementation through the Fix stage.
            Stage::Fix
        } else {
            stage
        };

        let is_fix = kind == ErrorKind::TestFailure;
        let updated = self
            .persist(&item.id, item.version, move |i| {
                if is_fix {
                    i.fix_attempts += 1;
                } else {
                    i.record_attempt(stage);
                }
                i.current_stage = next_stage;
                i.status = ItemStatus::InProgress;
                if !delay.is_zero() {
                    i.not_before =
                        Some(Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64));
                }
            })
            .await?;

        Ok(ProcessingSummary {
            item_id: updated.id.clone(),
            stage_before: stage,
            stage_after: updated.current_stage,
            status: updated.status,
            outcome: format!("recovery:{}", decision.strategy),
            checkpoint_seq: Some(seq),
        })
    }

    async fn handle_fatal(
        &self,
        item: WorkflowItem,
        stage: Stage,
        result: StageResult,
    ) -> EngineResult<ProcessingSummary> {
        let error = result.error.unwrap_or_else(|| {
            EngineError::Other(anyhow::anyhow!("Stage reported fatal without an error"))
        });

        warn!(item = %item.id, stage = %stage, error = %error, "Fatal stage failure");

        let seq = self
            .checkpoints
            .checkpoint(
                &item.id,
                stage,
                CheckpointPayload::StageOutcome {
                    outcome: StageOutcome::Fatal.as_str().to_string(),
                    next_stage: None,
                    error: Some(error.to_string()),
                },
            )
            .await?;

        let updated = self
            .persist(&item.id, item.version, |i| i.advance_to(Stage::Failed))
            .await?;

        let effects = SideEffects::default().comment(format!(
            "Automation failed permanently at stage `{}`: {}",
            stage, error
        ));
        self.apply_side_effects(&item.id, &effects).await;

        self.store.archive(&updated.id).await?;

        Ok(ProcessingSummary {
            item_id: updated.id.clone(),
            stage_before: stage,
            stage_after: Stage::Failed,
            status: updated.status,
            outcome: StageOutcome::Fatal.as_str().to_string(),
            checkpoint_seq: Some(seq),
        })
    }

    async fn load_or_create(&self, trigger: &Trigger) -> EngineResult<WorkflowItem> {
        if let Some(item) = self.store.load(&trigger.item_id).await? {
            return Ok(item);
        }

        let remote = self.git.get_item(&trigger.item_id).await?;
        let item = WorkflowItem::new(&trigger.item_id, remote.labels);

        match self.store.create(item).await {
            Ok(item) => {
                info!(item = %item.id, label = %trigger.event_label, "Item created");
                Ok(item)
            }
            // Lost a create race with another trigger; the row exists now.
            Err(EngineError::AlreadyExists(_)) => self
                .store
                .load(&trigger.item_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(trigger.item_id.clone())),
            Err(e) => Err(e),
        }
    }

    /// Versioned update with bounded reload-and-retry on conflicts.
    async fn persist<F>(
        &self,
        id: &str,
        mut expected_version: u64,
        mutator: F,
    ) -> EngineResult<WorkflowItem>
    where
        F: Fn(&mut WorkflowItem) + Clone + Send + 'static,
    {
        const MAX_CONFLICT_RETRIES: u32 = 3;

        let mut attempt = 0;
        loop {
            match self
                .store
                .update(id, expected_version, mutator.clone())
                .await
            {
                Ok(item) => return Ok(item),
                Err(e @ EngineError::StateConflict { .. }) => {
                    attempt += 1;
                    if attempt >= MAX_CONFLICT_RETRIES {
                        return Err(e);
                    }
                    let EngineError::StateConflict { actual, .. } = e else {
                        unreachable!()
                    };
                    expected_version = actual;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply declared side effects through the git collaborator. Label and
    /// comment failures are logged, not fatal: they never block a pipeline
    /// state change that was already checkpointed.
    async fn apply_side_effects(&self, item_id: &str, effects: &SideEffects) {
        for label in &effects.remove_labels {
            if let Err(e) = self.git.remove_label(item_id, label).await {
                warn!(item = %item_id, label = %label, error = %e, "Failed to remove label");
            }
        }
        for label in &effects.add_labels {
            if let Err(e) = self.git.add_label(item_id, label).await {
                warn!(item = %item_id, label = %label, error = %e, "Failed to add label");
            }
        }
        for comment in &effects.comments {
            if let Err(e) = self.git.post_comment(item_id, comment).await {
                warn!(item = %item_id, error = %e, "Failed to post comment");
            }
        }
    }

    /// The current plan, restored from the most recent plan snapshot.
    async fn latest_plan(&self, item_id: &str) -> EngineResult<Option<Plan>> {
        let checkpoints = self.checkpoints.history(item_id).await?;
        Ok(checkpoints
            .into_iter()
            .rev()
            .find_map(|cp| cp.plan().cloned()))
    }

    /// Failing output from the most recent test-fix decision.
    async fn latest_fix_context(&self, item_id: &str) -> EngineResult<Option<String>> {
        let checkpoints = self.checkpoints.history(item_id).await?;
        Ok(checkpoints.into_iter().rev().find_map(|cp| match cp.payload {
            CheckpointPayload::RecoveryDecision {
                strategy, context, ..
            } if strategy == "test_fix" => context,
            _ => None,
        }))
    }
}

fn summary_noop(item: &WorkflowItem, stage_before: Stage, outcome: &str) -> ProcessingSummary {
    ProcessingSummary {
        item_id: item.id.clone(),
        stage_before,
        stage_after: item.current_stage,
        status: item.status,
        outcome: outcome.to_string(),
        checkpoint_seq: None,
    }
}
