//! Bounded-concurrency execution of a plan's task graph.
//!
//! The executor dispatches ready tasks up to `max_concurrency`, feeds
//! completions back into the scheduler, and recomputes the ready set as slots
//! free up. A task failure poisons its transitive dependents but independent
//! branches keep running; execution concludes once no task is ready or
//! running. Cancellation stops new dispatch immediately and lets running
//! tasks observe the token cooperatively.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::graph::TaskScheduler;
use crate::plan::{Task, TaskResult, TaskStatus};

/// Executes one task to completion. Implementations are expected to watch
/// the cancellation token and return early when it fires.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> EngineResult<TaskResult>;
}

/// Events emitted during plan execution, consumed by the orchestrator for
/// checkpointing after every task state change.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started { task_id: String },
    /// A task reached a terminal status; `snapshot` is the full task list
    /// with current statuses, suitable for a plan checkpoint.
    Finished {
        task_id: String,
        status: TaskStatus,
        snapshot: Vec<Task>,
    },
}

/// Aggregated result of one plan execution round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// True only if every task succeeded
    pub success: bool,
    /// True when execution stopped on the cancel signal
    pub cancelled: bool,
    /// Final task states, including results and attempt counts
    pub tasks: Vec<Task>,
    /// Ids of failed tasks (direct failures and poisoned dependents)
    pub failed: Vec<String>,
}

/// Configuration for the parallel executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum tasks in flight at once
    pub max_concurrency: usize,
    /// Wall-clock deadline per task
    pub task_timeout: Duration,
}

/// The dependency-aware parallel task executor.
pub struct ParallelExecutor {
    config: ExecutorConfig,
    event_tx: Option<mpsc::Sender<TaskEvent>>,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<TaskEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Execute the tasks until quiescence or cancellation.
    ///
    /// The scheduler is built first, so a cyclic or malformed dependency set
    /// fails here and no task is ever dispatched. Tasks checkpointed as
    /// succeeded are recorded up front and never re-run.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        runner: Arc<dyn TaskRunner>,
        cancel: CancellationToken,
    ) -> EngineResult<PlanOutcome> {
        let mut scheduler = TaskScheduler::from_tasks(tasks)?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(String, EngineResult<TaskResult>)>(self.config.max_concurrency.max(1));

        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            // Dispatch ready tasks while slots are free. Ready order is
            // deterministic, so dispatch order is reproducible across runs.
            if !cancel.is_cancelled() {
                for task_id in scheduler.ready_set() {
                    if in_flight.len() >= self.config.max_concurrency {
                        break;
                    }

                    let Some(task) = scheduler.task_snapshot(&task_id) else {
                        continue;
                    };
                    scheduler.mark_running(&task_id);
                    self.emit(TaskEvent::Started {
                        task_id: task_id.clone(),
                    })
                    .await;

                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| EngineError::Other(anyhow::anyhow!("Semaphore closed: {}", e)))?;
                    let result_tx = result_tx.clone();
                    let runner = runner.clone();
                    let cancel = cancel.clone();
                    let timeout = self.config.task_timeout;

                    let handle = tokio::spawn(async move {
                        let _permit = permit;

                        let result =
                            match tokio::time::timeout(timeout, runner.run(&task, &cancel)).await {
                                Ok(result) => result,
                                Err(_) => Err(EngineError::StageTimeout {
                                    stage: format!("task:{}", task.task_id),
                                    elapsed_secs: timeout.as_secs(),
                                }),
                            };

                        result_tx.send((task.task_id.clone(), result)).await.ok();
                    });

                    in_flight.insert(task_id, handle);
                }
            }

            if in_flight.is_empty() {
                if cancel.is_cancelled() || scheduler.is_quiescent() {
                    break;
                }
                // Newly unblocked tasks appear on the next pass.
                continue;
            }

            // Wait for a completion; a fired cancel token only stops new
            // dispatch — running tasks drain through the same channel.
            let Some((task_id, result)) = result_rx.recv().await else {
                break;
            };

            if let Some(handle) = in_flight.remove(&task_id) {
                handle.await.ok();
            }

            let status = match result {
                Ok(task_result) => {
                    debug!(task = %task_id, "Task succeeded");
                    scheduler.mark_succeeded(&task_id, task_result);
                    TaskStatus::Succeeded
                }
                Err(_) if cancel.is_cancelled() => {
                    // Interrupted mid-flight, not a real failure: the task
                    // goes back to the pool for the resume run.
                    scheduler.mark_interrupted(&task_id);
                    continue;
                }
                Err(e) => {
                    warn!(task = %task_id, error = %e, "Task failed");
                    scheduler.mark_failed(&task_id, &e.to_string());
                    TaskStatus::Failed
                }
            };

            self.emit(TaskEvent::Finished {
                task_id,
                status,
                snapshot: scheduler.snapshot(),
            })
            .await;
        }

        let cancelled = cancel.is_cancelled();
        let success = !cancelled && scheduler.all_succeeded();
        let failed = scheduler.failed_ids();

        Ok(PlanOutcome {
            success,
            cancelled,
            tasks: scheduler.snapshot(),
            failed,
        })
    }

    async fn emit(&self, event: TaskEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
