//! Collaborator interfaces consumed by the engine core.
//!
//! The orchestration engine never talks to a git host or an AI backend
//! directly; it goes through these narrow capability traits. Concrete
//! adapters (`github`, `agent`) live beside them, and tests substitute stubs.
//! Credentials are resolved outside the core: the adapters receive tokens
//! from a `CredentialResolver` and the engine never sees raw secret material.

pub mod agent;
pub mod github;

pub use agent::CliAgent;
pub use github::GitHubClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;

/// An issue/PR as seen by the git host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Parameters for opening a pull request.
#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    /// Head branch carrying the change
    pub head: String,
    /// Base branch to merge into; empty means the repository default
    pub base: String,
}

/// Git-hosting capabilities the engine consumes.
///
/// Any call may fail with a distinguishable retryable-vs-not error; the core
/// receives all such failures as `EngineError::ExternalService`.
#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn get_item(&self, id: &str) -> EngineResult<RemoteItem>;
    async fn list_labels(&self, id: &str) -> EngineResult<Vec<String>>;
    async fn add_label(&self, id: &str, label: &str) -> EngineResult<()>;
    async fn remove_label(&self, id: &str, label: &str) -> EngineResult<()>;
    async fn post_comment(&self, id: &str, text: &str) -> EngineResult<()>;
    /// Create a branch from the default branch head; returns the ref name.
    async fn create_branch(&self, name: &str) -> EngineResult<String>;
    /// Returns the new pull request's id.
    async fn create_pull_request(&self, spec: &PullRequestSpec) -> EngineResult<String>;
    async fn merge_pull_request(&self, id: &str) -> EngineResult<()>;
    /// Items currently carrying the given label — the daemon's batch trigger.
    async fn list_triggered(&self, label: &str) -> EngineResult<Vec<RemoteItem>>;
}

/// A request to the AI agent backend.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    /// Additional context appended after the prompt (failing test output,
    /// review findings)
    pub context: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// The full text sent to the backend.
    pub fn full_prompt(&self) -> String {
        match &self.context {
            Some(ctx) => format!("{}\n\n{}", self.prompt, ctx),
            None => self.prompt.clone(),
        }
    }
}

/// Response from the AI agent backend.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub output: String,
}

/// AI agent capability the engine consumes. Errors are retryable (rate
/// limit, timeout) or non-retryable (invalid request), surfaced as
/// `EngineError::ExternalService`.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn generate(&self, request: AgentRequest) -> EngineResult<AgentResponse>;
}

/// Supplies already-resolved secrets to the adapters.
pub trait CredentialResolver: Send + Sync {
    /// Resolve a named credential, or `None` when it is not configured.
    fn resolve(&self, key: &str) -> Option<String>;
}

/// Resolver backed by process environment variables.
pub struct EnvCredentials;

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}
