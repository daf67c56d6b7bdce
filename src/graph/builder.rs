//! Task graph construction and validation.
//!
//! The builder takes a plan's tasks with their dependency edges and constructs
//! a directed acyclic graph for the scheduler. Validation rejects duplicate
//! ids, unknown or self-referential dependencies, and cycles — a plan must be
//! structurally sound before any task is dispatched.

use std::collections::{HashMap, HashSet};

use crate::errors::{EngineError, EngineResult};
use crate::plan::Task;

/// Index into the task list.
pub type TaskIndex = usize;

/// A directed acyclic graph of tasks.
#[derive(Debug)]
pub struct TaskGraph {
    /// Tasks indexed by their position
    tasks: Vec<Task>,
    /// Map from task id to index
    index_map: HashMap<String, TaskIndex>,
    /// Forward edges: index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// Reverse edges: index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get_task(&self, index: TaskIndex) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn get_index(&self, task_id: &str) -> Option<TaskIndex> {
        self.index_map.get(task_id).copied()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Tasks that depend on the given task (forward edges).
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks the given task depends on (reverse edges).
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Check if every dependency of a task is in the completed set.
    pub fn dependencies_satisfied(
        &self,
        index: TaskIndex,
        completed: &HashSet<TaskIndex>,
    ) -> bool {
        self.dependencies(index).iter().all(|dep| completed.contains(dep))
    }

    /// All transitive dependents of a task, the set poisoned by its failure.
    pub fn transitive_dependents(&self, index: TaskIndex) -> HashSet<TaskIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<TaskIndex> = self.dependents(index).to_vec();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend_from_slice(self.dependents(node));
            }
        }
        seen
    }
}

/// Builder for validated task graphs.
pub struct GraphBuilder {
    tasks: Vec<Task>,
}

impl GraphBuilder {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Build the task graph.
    ///
    /// Validates the structure:
    /// - Task ids are unique
    /// - Dependencies reference existing tasks in the same plan
    /// - No task depends on itself
    /// - No cycles
    pub fn build(self) -> EngineResult<TaskGraph> {
        let mut index_map = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if index_map.insert(task.task_id.clone(), i).is_some() {
                return Err(EngineError::permanent(format!(
                    "Duplicate task id in plan: {}",
                    task.task_id
                )));
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];

        for (to_idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if *dep == task.task_id {
                    return Err(EngineError::permanent(format!(
                        "Task {} depends on itself",
                        task.task_id
                    )));
                }
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    EngineError::permanent(format!(
                        "Unknown dependency '{}' in task '{}': no task with that id in the plan",
                        dep, task.task_id
                    ))
                })?;

                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = TaskGraph {
            tasks: self.tasks,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Cycle detection via Kahn's algorithm: repeatedly remove zero-in-degree
    /// nodes; anything left over sits on a cycle and is reported by id.
    fn validate_no_cycles(graph: &TaskGraph) -> EngineResult<()> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let mut nodes: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_task(i).map(|t| t.task_id.clone()))
                .collect();
            nodes.sort();

            return Err(EngineError::DependencyCycle { nodes });
        }

        Ok(())
    }
}
