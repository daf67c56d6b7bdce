//! Append-only checkpoint log.
//!
//! Checkpoints are immutable progress snapshots keyed by `(item_id, seq)`
//! with a strictly increasing sequence per item. They are written after every
//! stage or executor state change and read back on startup: the highest
//! sequence number is authoritative for resume, and succeeded tasks recorded
//! in a plan snapshot are never re-dispatched.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::pipeline::Stage;
use crate::plan::Plan;
use crate::store::db::{DbHandle, StateDb};

/// What a checkpoint records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointPayload {
    /// A stage finished with an outcome; `next_stage` is set when advancing.
    StageOutcome {
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_stage: Option<Stage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Plan and task statuses at a point during Implementation.
    PlanSnapshot { plan: Plan },
    /// A recovery decision was taken for a failed stage.
    RecoveryDecision {
        strategy: String,
        delay_secs: u64,
        escalate: bool,
        /// Context attached for the next round (failing test output)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
}

/// An immutable progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub item_id: String,
    pub seq: u64,
    pub stage: Stage,
    pub payload: CheckpointPayload,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The plan carried by this checkpoint, if it is a plan snapshot.
    pub fn plan(&self) -> Option<&Plan> {
        match &self.payload {
            CheckpointPayload::PlanSnapshot { plan } => Some(plan),
            _ => None,
        }
    }
}

impl StateDb {
    /// Append a checkpoint and return its sequence number. The sequence is
    /// allocated inside the insert transaction so it is strictly increasing
    /// per item even under concurrent writers.
    pub fn append_checkpoint(
        &self,
        item_id: &str,
        stage: Stage,
        payload: &CheckpointPayload,
    ) -> EngineResult<u64> {
        let json = serde_json::to_string(payload)
            .context("Failed to serialize checkpoint payload")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE item_id = ?1",
            params![item_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO checkpoints (item_id, seq, stage, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![item_id, seq, stage.key(), json, Utc::now().to_rfc3339()],
        )?;

        tx.commit().context("Failed to commit checkpoint")?;
        Ok(seq as u64)
    }

    /// The latest checkpoint for an item, if any.
    pub fn latest_checkpoint(&self, item_id: &str) -> EngineResult<Option<Checkpoint>> {
        let row = self
            .conn
            .query_row(
                "SELECT seq, stage, payload, created_at FROM checkpoints
                 WHERE item_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![item_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(seq, stage, payload, created_at)| parse_checkpoint(item_id, seq, &stage, &payload, &created_at))
            .transpose()
    }

    /// Full checkpoint history for an item, oldest first.
    pub fn list_checkpoints(&self, item_id: &str) -> EngineResult<Vec<Checkpoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, stage, payload, created_at FROM checkpoints
             WHERE item_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![item_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (seq, stage, payload, created_at) = row?;
            checkpoints.push(parse_checkpoint(item_id, seq, &stage, &payload, &created_at)?);
        }
        Ok(checkpoints)
    }
}

fn parse_checkpoint(
    item_id: &str,
    seq: i64,
    stage: &str,
    payload: &str,
    created_at: &str,
) -> EngineResult<Checkpoint> {
    let stage = Stage::from_key(stage)
        .ok_or_else(|| EngineError::Other(anyhow::anyhow!("Unknown stage in checkpoint: {}", stage)))?;
    let payload = serde_json::from_str(payload)
        .context("Failed to deserialize checkpoint payload")?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .context("Failed to parse checkpoint timestamp")?
        .with_timezone(&Utc);

    Ok(Checkpoint {
        item_id: item_id.to_string(),
        seq: seq as u64,
        stage,
        payload,
        created_at,
    })
}

/// Async facade over the checkpoint log.
#[derive(Clone)]
pub struct CheckpointManager {
    handle: DbHandle,
}

impl CheckpointManager {
    pub fn new(handle: DbHandle) -> Self {
        Self { handle }
    }

    pub async fn checkpoint(
        &self,
        item_id: &str,
        stage: Stage,
        payload: CheckpointPayload,
    ) -> EngineResult<u64> {
        let item_id = item_id.to_string();
        self.handle
            .call(move |db| db.append_checkpoint(&item_id, stage, &payload))
            .await
    }

    pub async fn latest(&self, item_id: &str) -> EngineResult<Option<Checkpoint>> {
        let item_id = item_id.to_string();
        self.handle.call(move |db| db.latest_checkpoint(&item_id)).await
    }

    /// Full history for an item, oldest first.
    pub async fn history(&self, item_id: &str) -> EngineResult<Vec<Checkpoint>> {
        let item_id = item_id.to_string();
        self.handle.call(move |db| db.list_checkpoints(&item_id)).await
    }
}
