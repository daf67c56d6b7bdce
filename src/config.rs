//! Configuration for the Foreman engine.
//!
//! Settings are read from `.foreman/foreman.toml` with sensible defaults for
//! every field, then overlaid with environment variables and CLI flags.
//! Numeric tuning values (retry bounds, backoff curve, timeouts, concurrency
//! limits) are deliberately configuration rather than constants.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_parallel_tasks = 4
//! max_concurrent_items = 2
//! stage_timeout_secs = 1800
//! task_timeout_secs = 900
//! poll_interval_secs = 30
//!
//! [recovery]
//! max_retries = 3
//! max_fix_attempts = 2
//! backoff_base_secs = 2
//! backoff_cap_secs = 300
//!
//! [labels]
//! trigger = "needs-planning"
//! approved = "approved"
//! needs_human = "needs-human"
//!
//! [github]
//! repo = "owner/repo"
//! api_base = "https://api.github.com"
//!
//! [agent]
//! command = "claude"
//! args = ["-p", "--output-format", "text"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::EngineError;

/// Directory holding foreman state inside a project.
pub const FOREMAN_DIR: &str = ".foreman";

/// Config file name inside the foreman directory.
pub const CONFIG_FILE: &str = "foreman.toml";

/// SQLite database file name inside the foreman directory.
pub const DB_FILE: &str = "state.db";

/// Engine-level tuning: concurrency bounds and deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Maximum tasks of one plan running at once
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    /// Maximum items processed concurrently by the daemon
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,
    /// Wall-clock deadline for one stage execution
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Wall-clock deadline for one task execution
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Daemon polling interval
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_max_parallel_tasks() -> usize {
    4
}

fn default_max_concurrent_items() -> usize {
    2
}

fn default_stage_timeout_secs() -> u64 {
    1800
}

fn default_task_timeout_secs() -> u64 {
    900
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            max_concurrent_items: default_max_concurrent_items(),
            stage_timeout_secs: default_stage_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl EngineSection {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Recovery bounds and the backoff curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    /// Retry bound for transient failures per stage
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Separate bound for test-fix round trips
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    /// Base delay of the exponential backoff
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Upper cap on any computed backoff delay
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_fix_attempts() -> u32 {
    2
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_cap_secs() -> u64 {
    300
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_fix_attempts: default_max_fix_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Label vocabulary the engine listens for and emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsSection {
    /// Label that admits an item into the pipeline
    #[serde(default = "default_trigger_label")]
    pub trigger: String,
    /// Label a human applies to approve a proposed plan
    #[serde(default = "default_approved_label")]
    pub approved: String,
    /// Label emitted when the engine gives up and asks for a human
    #[serde(default = "default_needs_human_label")]
    pub needs_human: String,
}

fn default_trigger_label() -> String {
    "needs-planning".to_string()
}

fn default_approved_label() -> String {
    "approved".to_string()
}

fn default_needs_human_label() -> String {
    "needs-human".to_string()
}

impl Default for LabelsSection {
    fn default() -> Self {
        Self {
            trigger: default_trigger_label(),
            approved: default_approved_label(),
            needs_human: default_needs_human_label(),
        }
    }
}

/// Git-hosting adapter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubSection {
    /// Repository slug, e.g. "owner/repo"
    #[serde(default)]
    pub repo: Option<String>,
    /// API base URL (override for GHES)
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

/// Agent adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Command to spawn for agent invocations
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Extra arguments passed before the prompt
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
        }
    }
}

/// The full foreman configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub labels: LabelsSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub agent: AgentSection,
}

impl ForemanConfig {
    /// Load configuration from `.foreman/foreman.toml` under the project dir,
    /// falling back to defaults when the file does not exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Overlay environment variables onto file values.
    fn apply_env(&mut self) {
        if let Ok(repo) = std::env::var("FOREMAN_REPO") {
            self.github.repo = Some(repo);
        }
        if let Ok(cmd) = std::env::var("FOREMAN_AGENT_CMD") {
            self.agent.command = cmd;
        }
    }

    /// Serialize back to TOML (used by `foreman init` and `foreman config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Validate tuning values. Called once at startup; any violation is a
    /// `Configuration` error and the process must stop before touching items.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.engine.max_parallel_tasks == 0 {
            return Err(EngineError::Configuration(
                "engine.max_parallel_tasks must be at least 1".to_string(),
            ));
        }
        if self.engine.max_concurrent_items == 0 {
            return Err(EngineError::Configuration(
                "engine.max_concurrent_items must be at least 1".to_string(),
            ));
        }
        if self.engine.stage_timeout_secs == 0 || self.engine.task_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "stage and task timeouts must be non-zero".to_string(),
            ));
        }
        if self.recovery.backoff_base_secs > self.recovery.backoff_cap_secs {
            return Err(EngineError::Configuration(format!(
                "recovery.backoff_base_secs ({}) exceeds backoff_cap_secs ({})",
                self.recovery.backoff_base_secs, self.recovery.backoff_cap_secs
            )));
        }
        if self.labels.trigger.is_empty() {
            return Err(EngineError::Configuration(
                "labels.trigger must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Path to the foreman directory for a project.
pub fn foreman_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(FOREMAN_DIR)
}

/// Path to the config file for a project.
pub fn config_path(project_dir: &Path) -> PathBuf {
    foreman_dir(project_dir).join(CONFIG_FILE)
}

/// Path to the state database for a project.
pub fn db_path(project_dir: &Path) -> PathBuf {
    foreman_dir(project_dir).join(DB_FILE)
}

/// Check if a project has been initialized.
pub fn is_initialized(project_dir: &Path) -> bool {
    config_path(project_dir).exists()
}
