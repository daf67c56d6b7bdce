//! Local CLI adapter for the `AgentProvider` contract.
//!
//! Spawns the configured agent command, writes the prompt to stdin, and
//! collects stdout as the response. A missing binary is a configuration
//! problem; a non-zero exit is reported retryable unless the process signals
//! an invalid request (exit code 2, the conventional usage-error code).

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::AgentSection;
use crate::errors::{EngineError, EngineResult};
use crate::providers::{AgentProvider, AgentRequest, AgentResponse};

/// Exit code agents use for a malformed/invalid request.
const EXIT_INVALID_REQUEST: i32 = 2;

pub struct CliAgent {
    command: String,
    args: Vec<String>,
}

impl CliAgent {
    pub fn new(config: &AgentSection) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl AgentProvider for CliAgent {
    async fn generate(&self, request: AgentRequest) -> EngineResult<AgentResponse> {
        let prompt = request.full_prompt();
        debug!(command = %self.command, prompt_len = prompt.len(), "Spawning agent process");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::Configuration(format!(
                    "Failed to spawn agent command '{}': {}",
                    self.command, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| EngineError::transient(format!("Failed to write agent prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| EngineError::transient(format!("Failed to close agent stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::transient(format!("Agent process failed: {}", e)))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("Agent exited with code {}: {}", code, stderr.trim());
            return Err(EngineError::ExternalService {
                message,
                retryable: code != EXIT_INVALID_REQUEST,
                status: None,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(AgentResponse { output: stdout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentSection;

    fn agent(command: &str, args: &[&str]) -> CliAgent {
        CliAgent::new(&AgentSection {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn echoes_stdin_through_cat() {
        let agent = agent("cat", &[]);
        let response = agent
            .generate(AgentRequest::new("hello agent"))
            .await
            .unwrap();
        assert_eq!(response.output, "hello agent");
    }

    #[tokio::test]
    async fn missing_binary_is_a_configuration_error() {
        let agent = agent("definitely-not-a-real-binary-xyz", &[]);
        let err = agent.generate(AgentRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_is_retryable() {
        let agent = agent("sh", &["-c", "exit 1"]);
        let err = agent.generate(AgentRequest::new("hi")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn usage_error_exit_is_not_retryable() {
        let agent = agent("sh", &["-c", "exit 2"]);
        let err = agent.generate(AgentRequest::new("hi")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
