//! Durable state: versioned item records and the append-only checkpoint log.
//!
//! `StateDb` is the synchronous SQLite layer; `DbHandle` routes access
//! through `spawn_blocking`; `StateStore` and `CheckpointManager` are the
//! async facades the orchestrator talks to. Both facades share one handle so
//! item updates and checkpoints land in the same database.

mod checkpoint;
mod db;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointPayload};
pub use db::{DbHandle, StateDb};

use crate::errors::EngineResult;
use crate::item::{ItemStatus, WorkflowItem};

/// Async facade over the versioned item records.
#[derive(Clone)]
pub struct StateStore {
    handle: DbHandle,
}

impl StateStore {
    pub fn new(handle: DbHandle) -> Self {
        Self { handle }
    }

    pub async fn load(&self, id: &str) -> EngineResult<Option<WorkflowItem>> {
        let id = id.to_string();
        self.handle.call(move |db| db.load_item(&id)).await
    }

    pub async fn create(&self, item: WorkflowItem) -> EngineResult<WorkflowItem> {
        self.handle.call(move |db| db.create_item(&item)).await
    }

    /// Apply a mutation under optimistic concurrency. On `StateConflict` the
    /// caller reloads and retries; the store never merges silently.
    pub async fn update<F>(
        &self,
        id: &str,
        expected_version: u64,
        mutator: F,
    ) -> EngineResult<WorkflowItem>
    where
        F: FnOnce(&mut WorkflowItem) + Send + 'static,
    {
        let id = id.to_string();
        self.handle
            .call(move |db| db.update_item(&id, expected_version, mutator))
            .await
    }

    pub async fn archive(&self, id: &str) -> EngineResult<()> {
        let id = id.to_string();
        self.handle.call(move |db| db.archive_item(&id)).await
    }

    pub async fn list(&self) -> EngineResult<Vec<WorkflowItem>> {
        self.handle.call(|db| db.list_items()).await
    }

    pub async fn list_with_status(&self, status: ItemStatus) -> EngineResult<Vec<WorkflowItem>> {
        self.handle
            .call(move |db| db.list_items_with_status(status))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::pipeline::Stage;

    fn store() -> StateStore {
        StateStore::new(DbHandle::new(StateDb::new_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn async_facade_round_trips() {
        let store = store();
        let item = WorkflowItem::new("42", vec![]);
        store.create(item).await.unwrap();

        let loaded = store.load("42").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);

        let updated = store
            .update("42", 1, |i| i.advance_to(Stage::PlanReview))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn concurrent_updates_with_stale_version_yield_one_conflict() {
        let store = store();
        store.create(WorkflowItem::new("42", vec![])).await.unwrap();

        // Two writers race with the same expected version.
        let a = store.update("42", 1, |i| {
            i.record_attempt(Stage::Planning);
        });
        let b = store.update("42", 1, |i| {
            i.record_attempt(Stage::Planning);
        });
        let (ra, rb) = tokio::join!(a, b);

        let outcomes = [ra, rb];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|r| matches!(r, Err(EngineError::StateConflict { .. })))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);

        // Exactly one attempt was recorded.
        let item = store.load("42").await.unwrap().unwrap();
        assert_eq!(item.attempts_for(Stage::Planning), 1);
        assert_eq!(item.version, 2);
    }
}
