//! Typed error hierarchy for the Foreman engine.
//!
//! `EngineError` is the single taxonomy the orchestrator, recovery manager,
//! and collaborator adapters speak. Every failure the engine can observe maps
//! onto one of these variants so that recovery classification is a pure match
//! over data rather than string inspection.

use thiserror::Error;

/// Errors surfaced by the orchestration engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or missing configuration. Fatal: raised before any item is
    /// touched, never during processing.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A git-hosting or agent call failed. `retryable` distinguishes rate
    /// limits and transport faults from permanent rejections.
    #[error("External service error: {message}")]
    ExternalService {
        message: String,
        retryable: bool,
        status: Option<u16>,
    },

    /// Optimistic-concurrency failure on a state record. The caller must
    /// reload and retry the mutation, never overwrite blindly.
    #[error("Version conflict on item {id}: expected {expected}, found {actual}")]
    StateConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// `create` was called for an id that already has a record.
    #[error("Item {0} already exists")]
    AlreadyExists(String),

    /// No record for the requested item id.
    #[error("Item {0} not found")]
    NotFound(String),

    /// The task dependency graph contains a cycle. Fatal for the affected
    /// plan; the plan definition must be corrected by a human.
    #[error("Dependency cycle involving tasks: {nodes:?}")]
    DependencyCycle { nodes: Vec<String> },

    /// A stage or task exceeded its wall-clock deadline.
    #[error("Stage {stage} timed out after {elapsed_secs}s")]
    StageTimeout { stage: String, elapsed_secs: u64 },

    /// Merging or rebasing a branch hit conflicting edits.
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// A verification run failed; carries the failing output as fix context.
    #[error("Tests failed: {summary}")]
    TestFailure { summary: String, output: String },

    /// Recovery is exhausted or no strategy applies. Terminal-but-not-failed:
    /// the engine stops touching the item until externally re-triggered.
    #[error("Manual intervention required: {reason}")]
    ManualInterventionRequired { reason: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Shorthand for a retryable external-service failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ExternalService {
            message: message.into(),
            retryable: true,
            status: None,
        }
    }

    /// Shorthand for a permanent external-service failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::ExternalService {
            message: message.into(),
            retryable: false,
            status: None,
        }
    }

    /// Whether this error may succeed on a plain retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalService { retryable, .. } => *retryable,
            Self::StageTimeout { .. } | Self::StateConflict { .. } => true,
            _ => false,
        }
    }
}

/// Engine-wide result alias.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_service_carries_retryable_flag() {
        let err = EngineError::ExternalService {
            message: "503 from api".to_string(),
            retryable: true,
            status: Some(503),
        };
        assert!(err.is_retryable());
        match &err {
            EngineError::ExternalService { status, .. } => assert_eq!(*status, Some(503)),
            _ => panic!("Expected ExternalService variant"),
        }
    }

    #[test]
    fn permanent_shorthand_is_not_retryable() {
        let err = EngineError::permanent("bad request");
        assert!(!err.is_retryable());
    }

    #[test]
    fn state_conflict_carries_versions() {
        let err = EngineError::StateConflict {
            id: "42".to_string(),
            expected: 3,
            actual: 5,
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("found 5"));
    }

    #[test]
    fn dependency_cycle_reports_offending_nodes() {
        let err = EngineError::DependencyCycle {
            nodes: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a"));
        assert!(msg.contains("b"));
    }

    #[test]
    fn timeout_is_retryable() {
        let err = EngineError::StageTimeout {
            stage: "implementation".to_string(),
            elapsed_secs: 900,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failure_keeps_output_for_fix_context() {
        let err = EngineError::TestFailure {
            summary: "2 tests failed".to_string(),
            output: "assertion failed: left == right".to_string(),
        };
        match &err {
            EngineError::TestFailure { output, .. } => {
                assert!(output.contains("assertion"));
            }
            _ => panic!("Expected TestFailure"),
        }
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::Configuration("x".into()));
        assert_std_error(&EngineError::NotFound("42".into()));
    }
}
