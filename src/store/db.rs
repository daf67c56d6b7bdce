//! SQLite-backed state store with optimistic concurrency.
//!
//! One versioned row per workflow item. Every update runs in a transaction
//! that checks the caller's expected version in the WHERE clause; a stale
//! version is rejected with `StateConflict`, never silently merged. Rows are
//! archived rather than deleted so history survives completion.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::{EngineError, EngineResult};
use crate::item::{ItemStatus, WorkflowItem};

/// Async-safe handle to the state database.
///
/// Wraps `StateDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StateDb>>,
}

impl DbHandle {
    pub fn new(db: StateDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&StateDb) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| EngineError::Other(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| EngineError::Other(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

pub struct StateDb {
    pub(crate) conn: Connection,
}

impl StateDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> EngineResult<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> EngineResult<()> {
        // Acknowledged writes must survive a crash, so synchronous stays FULL.
        self.conn
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = FULL;",
            )
            .context("Failed to set database pragmas")?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS items (
                    id TEXT PRIMARY KEY,
                    record TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    archived INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    item_id TEXT NOT NULL,
                    seq INTEGER NOT NULL,
                    stage TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (item_id, seq)
                );

                CREATE INDEX IF NOT EXISTS idx_items_status ON items(status, archived);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Insert a new item record. Fails with `AlreadyExists` when a row for
    /// the id is present, archived or not.
    pub fn create_item(&self, item: &WorkflowItem) -> EngineResult<WorkflowItem> {
        let record = serde_json::to_string(item)
            .context("Failed to serialize item record")?;

        let result = self.conn.execute(
            "INSERT INTO items (id, record, version, status, stage, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                item.id,
                record,
                item.version as i64,
                item.status.as_str(),
                item.current_stage.key(),
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(item.clone()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(EngineError::AlreadyExists(item.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load an item record by id. Archived rows are still loadable; callers
    /// that only want live items filter on status.
    pub fn load_item(&self, id: &str) -> EngineResult<Option<WorkflowItem>> {
        let record: Option<String> = self
            .conn
            .query_row("SELECT record FROM items WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;

        match record {
            Some(json) => {
                let item = serde_json::from_str(&json)
                    .context("Failed to deserialize item record")?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Apply `mutator` to the item under optimistic concurrency control.
    ///
    /// The current version is compared against `expected_version` inside a
    /// transaction; on mismatch the whole update is rejected with
    /// `StateConflict` and the caller must reload and retry.
    pub fn update_item<F>(
        &self,
        id: &str,
        expected_version: u64,
        mutator: F,
    ) -> EngineResult<WorkflowItem>
    where
        F: FnOnce(&mut WorkflowItem),
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let row: Option<(String, i64)> = tx
            .query_row(
                "SELECT record, version FROM items WHERE id = ?1 AND archived = 0",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (json, current_version) = row.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let current_version = current_version as u64;

        if current_version != expected_version {
            return Err(EngineError::StateConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }

        let mut item: WorkflowItem =
            serde_json::from_str(&json).context("Failed to deserialize item record")?;

        mutator(&mut item);
        item.version = current_version + 1;
        item.updated_at = chrono::Utc::now();

        let record = serde_json::to_string(&item)
            .context("Failed to serialize item record")?;

        let updated = tx.execute(
            "UPDATE items
             SET record = ?1, version = ?2, status = ?3, stage = ?4, updated_at = ?5
             WHERE id = ?6 AND version = ?7",
            params![
                record,
                item.version as i64,
                item.status.as_str(),
                item.current_stage.key(),
                item.updated_at.to_rfc3339(),
                id,
                expected_version as i64,
            ],
        )?;

        if updated == 0 {
            // Lost a race between the read and the write.
            return Err(EngineError::StateConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }

        tx.commit().context("Failed to commit item update")?;
        Ok(item)
    }

    /// Flag an item archived. The row and its checkpoints are retained.
    pub fn archive_item(&self, id: &str) -> EngineResult<()> {
        let updated = self
            .conn
            .execute("UPDATE items SET archived = 1 WHERE id = ?1", params![id])?;
        if updated == 0 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// All live (non-archived) items, newest first.
    pub fn list_items(&self) -> EngineResult<Vec<WorkflowItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM items WHERE archived = 0 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for json in rows {
            let item = serde_json::from_str(&json?)
                .context("Failed to deserialize item record")?;
            items.push(item);
        }
        Ok(items)
    }

    /// Live items in a given status — the daemon's resume and de-dup query.
    pub fn list_items_with_status(&self, status: ItemStatus) -> EngineResult<Vec<WorkflowItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM items WHERE archived = 0 AND status = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;

        let mut items = Vec::new();
        for json in rows {
            let item = serde_json::from_str(&json?)
                .context("Failed to deserialize item record")?;
            items.push(item);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    fn item(id: &str) -> WorkflowItem {
        WorkflowItem::new(id, vec!["needs-planning".to_string()])
    }

    #[test]
    fn create_and_load_round_trip() {
        let db = StateDb::new_in_memory().unwrap();
        db.create_item(&item("42")).unwrap();

        let loaded = db.load_item("42").unwrap().unwrap();
        assert_eq!(loaded.id, "42");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.current_stage, Stage::Planning);
    }

    #[test]
    fn create_duplicate_fails_already_exists() {
        let db = StateDb::new_in_memory().unwrap();
        db.create_item(&item("42")).unwrap();

        let err = db.create_item(&item("42")).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn load_missing_returns_none() {
        let db = StateDb::new_in_memory().unwrap();
        assert!(db.load_item("missing").unwrap().is_none());
    }

    #[test]
    fn update_bumps_version() {
        let db = StateDb::new_in_memory().unwrap();
        db.create_item(&item("42")).unwrap();

        let updated = db
            .update_item("42", 1, |i| i.advance_to(Stage::PlanReview))
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.current_stage, Stage::PlanReview);

        let loaded = db.load_item("42").unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[test]
    fn stale_version_is_rejected() {
        let db = StateDb::new_in_memory().unwrap();
        db.create_item(&item("42")).unwrap();

        // First update with version 1 succeeds
        db.update_item("42", 1, |i| i.advance_to(Stage::PlanReview))
            .unwrap();

        // Second update with the same stale version conflicts
        let err = db
            .update_item("42", 1, |i| i.advance_to(Stage::Approval))
            .unwrap_err();
        match err {
            EngineError::StateConflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("Expected StateConflict, got {:?}", other),
        }

        // The losing write changed nothing
        let loaded = db.load_item("42").unwrap().unwrap();
        assert_eq!(loaded.current_stage, Stage::PlanReview);
    }

    #[test]
    fn update_missing_item_is_not_found() {
        let db = StateDb::new_in_memory().unwrap();
        let err = db.update_item("missing", 1, |_| {}).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn archive_hides_from_live_listing() {
        let db = StateDb::new_in_memory().unwrap();
        db.create_item(&item("42")).unwrap();
        db.create_item(&item("43")).unwrap();

        db.archive_item("42").unwrap();

        let live = db.list_items().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "43");

        // Archived rows are still loadable directly
        assert!(db.load_item("42").unwrap().is_some());

        // But not updatable
        let err = db.update_item("42", 1, |_| {}).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn list_by_status_filters() {
        let db = StateDb::new_in_memory().unwrap();
        db.create_item(&item("42")).unwrap();
        db.create_item(&item("43")).unwrap();
        db.update_item("43", 1, |i| i.status = ItemStatus::InProgress)
            .unwrap();

        let pending = db.list_items_with_status(ItemStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "42");
    }
}
