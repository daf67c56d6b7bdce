//! Ready-set computation and task state tracking over a task graph.
//!
//! The scheduler owns per-task status for one plan execution. The ready set
//! is recomputed from the graph whenever a task reaches a terminal status;
//! dispatch order within a ready set is ascending lexical task id so that
//! runs are reproducible.

use std::collections::HashSet;

use crate::errors::EngineResult;
use crate::graph::builder::{GraphBuilder, TaskGraph, TaskIndex};
use crate::plan::{Task, TaskResult, TaskStatus};

/// Tracks execution state of one plan's tasks.
#[derive(Debug)]
pub struct TaskScheduler {
    graph: TaskGraph,
    statuses: Vec<TaskStatus>,
    results: Vec<Option<TaskResult>>,
    attempts: Vec<u32>,
    succeeded: HashSet<TaskIndex>,
    dispatched: HashSet<TaskIndex>,
}

impl TaskScheduler {
    /// Build a scheduler from a plan's tasks, validating the dependency
    /// graph. Prior statuses are restored so a checkpointed plan resumes
    /// where it left off: succeeded tasks are recorded as done and are never
    /// dispatched again.
    pub fn from_tasks(tasks: Vec<Task>) -> EngineResult<Self> {
        let graph = GraphBuilder::new(tasks).build()?;

        let mut statuses = Vec::with_capacity(graph.len());
        let mut results = Vec::with_capacity(graph.len());
        let mut attempts = Vec::with_capacity(graph.len());
        let mut succeeded = HashSet::new();
        let mut dispatched = HashSet::new();

        for (i, task) in graph.tasks().iter().enumerate() {
            // A task checkpointed as `running` was interrupted mid-flight; it
            // restarts from scratch on resume.
            let status = match task.status {
                TaskStatus::Running => TaskStatus::Blocked,
                other => other,
            };
            if status == TaskStatus::Succeeded {
                succeeded.insert(i);
                dispatched.insert(i);
            }
            if status == TaskStatus::Failed {
                dispatched.insert(i);
            }
            statuses.push(status);
            results.push(task.result.clone());
            attempts.push(task.attempts);
        }

        Ok(Self {
            graph,
            statuses,
            results,
            attempts,
            succeeded,
            dispatched,
        })
    }

    /// Compute the ready set: tasks whose every dependency succeeded and
    /// which have not been dispatched, in ascending lexical id order.
    pub fn ready_set(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .graph
            .tasks()
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                !self.dispatched.contains(i)
                    && !self.statuses[*i].is_terminal()
                    && self.graph.dependencies_satisfied(*i, &self.succeeded)
            })
            .map(|(_, t)| t.task_id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Mark a task dispatched and running.
    pub fn mark_running(&mut self, task_id: &str) {
        if let Some(idx) = self.graph.get_index(task_id) {
            self.dispatched.insert(idx);
            self.statuses[idx] = TaskStatus::Running;
            self.attempts[idx] += 1;
        }
    }

    /// Record a task success.
    pub fn mark_succeeded(&mut self, task_id: &str, result: TaskResult) {
        if let Some(idx) = self.graph.get_index(task_id) {
            self.statuses[idx] = TaskStatus::Succeeded;
            self.results[idx] = Some(result);
            self.succeeded.insert(idx);
        }
    }

    /// Record a task failure and poison all transitive dependents. Tasks on
    /// independent branches are untouched.
    pub fn mark_failed(&mut self, task_id: &str, detail: &str) {
        let Some(idx) = self.graph.get_index(task_id) else {
            return;
        };
        self.statuses[idx] = TaskStatus::Failed;
        self.results[idx] = Some(TaskResult::Error {
            detail: detail.to_string(),
        });

        for dep_idx in self.graph.transitive_dependents(idx) {
            if !self.statuses[dep_idx].is_terminal() {
                self.statuses[dep_idx] = TaskStatus::Failed;
                self.dispatched.insert(dep_idx);
                self.results[dep_idx] = Some(TaskResult::Error {
                    detail: format!("blocked by failed dependency {}", task_id),
                });
            }
        }
    }

    /// Put an interrupted task back into the pool (cooperative cancellation).
    pub fn mark_interrupted(&mut self, task_id: &str) {
        if let Some(idx) = self.graph.get_index(task_id) {
            self.dispatched.remove(&idx);
            self.statuses[idx] = TaskStatus::Blocked;
        }
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.graph.get_index(task_id).map(|i| self.statuses[i])
    }

    /// One task with its current status, result, and attempt count.
    pub fn task_snapshot(&self, task_id: &str) -> Option<Task> {
        let idx = self.graph.get_index(task_id)?;
        let mut task = self.graph.get_task(idx)?.clone();
        task.status = self.statuses[idx];
        task.result = self.results[idx].clone();
        task.attempts = self.attempts[idx];
        Some(task)
    }

    /// True when nothing is ready or running — the executor's stop condition.
    pub fn is_quiescent(&self) -> bool {
        let running = self
            .statuses
            .iter()
            .any(|s| matches!(s, TaskStatus::Running));
        !running && self.ready_set().is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded.len() == self.graph.len()
    }

    /// Ids of failed tasks (including those poisoned by a dependency).
    pub fn failed_ids(&self) -> Vec<String> {
        self.snapshot_ids_with(TaskStatus::Failed)
    }

    fn snapshot_ids_with(&self, status: TaskStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .graph
            .tasks()
            .iter()
            .enumerate()
            .filter(|(i, _)| self.statuses[*i] == status)
            .map(|(_, t)| t.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Export tasks with their current statuses, results, and attempt counts
    /// for checkpointing.
    pub fn snapshot(&self) -> Vec<Task> {
        self.graph
            .tasks()
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut task = t.clone();
                task.status = self.statuses[i];
                task.result = self.results[i].clone();
                task.attempts = self.attempts[i];
                task
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: Vec<&str>) -> Task {
        Task::new(id, &format!("task {}", id), deps.into_iter().map(String::from).collect())
    }

    fn ok(task_id: &str) -> TaskResult {
        TaskResult::Branch {
            branch_ref: format!("foreman/{}", task_id),
        }
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let mut sched = TaskScheduler::from_tasks(vec![
            task("t1", vec![]),
            task("t2", vec![]),
            task("t3", vec!["t1", "t2"]),
        ])
        .unwrap();

        assert_eq!(sched.ready_set(), vec!["t1", "t2"]);

        sched.mark_running("t1");
        sched.mark_succeeded("t1", ok("t1"));
        // t3 still waits on t2
        assert_eq!(sched.ready_set(), vec!["t2"]);

        sched.mark_running("t2");
        sched.mark_succeeded("t2", ok("t2"));
        assert_eq!(sched.ready_set(), vec!["t3"]);
    }

    #[test]
    fn ready_set_is_lexically_ordered() {
        let sched = TaskScheduler::from_tasks(vec![
            task("zeta", vec![]),
            task("alpha", vec![]),
            task("mid", vec![]),
        ])
        .unwrap();

        assert_eq!(sched.ready_set(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn failure_poisons_transitive_dependents_only() {
        let mut sched = TaskScheduler::from_tasks(vec![
            task("t1", vec![]),
            task("t2", vec!["t1"]),
            task("t3", vec!["t2"]),
            task("t4", vec![]),
        ])
        .unwrap();

        sched.mark_running("t1");
        sched.mark_failed("t1", "boom");

        assert_eq!(sched.status_of("t2"), Some(TaskStatus::Failed));
        assert_eq!(sched.status_of("t3"), Some(TaskStatus::Failed));
        // Independent branch keeps going
        assert_eq!(sched.ready_set(), vec!["t4"]);
        assert_eq!(sched.failed_ids(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn quiescence_after_everything_terminal() {
        let mut sched =
            TaskScheduler::from_tasks(vec![task("t1", vec![]), task("t2", vec!["t1"])]).unwrap();

        assert!(!sched.is_quiescent());
        sched.mark_running("t1");
        sched.mark_failed("t1", "boom");
        assert!(sched.is_quiescent());
        assert!(!sched.all_succeeded());
    }

    #[test]
    fn resume_skips_succeeded_and_restarts_interrupted() {
        let mut t1 = task("t1", vec![]);
        t1.status = TaskStatus::Succeeded;
        t1.result = Some(ok("t1"));
        let mut t2 = task("t2", vec![]);
        t2.status = TaskStatus::Succeeded;
        t2.result = Some(ok("t2"));
        let mut t3 = task("t3", vec!["t1", "t2"]);
        t3.status = TaskStatus::Running;

        let sched = TaskScheduler::from_tasks(vec![t1, t2, t3]).unwrap();

        // Only the interrupted task is re-dispatched
        assert_eq!(sched.ready_set(), vec!["t3"]);
    }

    #[test]
    fn snapshot_captures_current_state() {
        let mut sched =
            TaskScheduler::from_tasks(vec![task("t1", vec![]), task("t2", vec!["t1"])]).unwrap();
        sched.mark_running("t1");
        sched.mark_succeeded("t1", ok("t1"));

        let snapshot = sched.snapshot();
        assert_eq!(snapshot[0].status, TaskStatus::Succeeded);
        assert_eq!(snapshot[0].attempts, 1);
        assert_eq!(snapshot[1].status, TaskStatus::Blocked);

        let t1 = sched.task_snapshot("t1").unwrap();
        assert_eq!(t1.status, TaskStatus::Succeeded);
        assert!(sched.task_snapshot("missing").is_none());
    }

    #[test]
    fn interrupted_task_returns_to_pool() {
        let mut sched = TaskScheduler::from_tasks(vec![task("t1", vec![])]).unwrap();
        sched.mark_running("t1");
        assert!(sched.ready_set().is_empty());
        sched.mark_interrupted("t1");
        assert_eq!(sched.ready_set(), vec!["t1"]);
    }
}
