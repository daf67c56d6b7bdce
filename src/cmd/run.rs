//! Trigger processing and daemon mode — `foreman trigger`, `foreman daemon`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use foreman::config::{ForemanConfig, db_path, is_initialized};
use foreman::orchestrator::{DaemonContext, Orchestrator, Trigger, run_daemon};
use foreman::providers::{CliAgent, EnvCredentials, GitHubClient};
use foreman::store::{CheckpointManager, DbHandle, StateDb, StateStore};

/// Wire the engine together from the project's configuration. Configuration
/// problems (missing repo, missing token, bad tuning values) surface here,
/// before any item is touched.
fn build_engine(project_dir: &Path) -> Result<(Arc<Orchestrator>, Arc<ForemanConfig>)> {
    if !is_initialized(project_dir) {
        bail!("Project is not initialized. Run 'foreman init' first.");
    }

    let config = Arc::new(ForemanConfig::load_or_default(project_dir)?);
    config.validate()?;

    let handle = DbHandle::new(StateDb::new(&db_path(project_dir))?);
    let store = StateStore::new(handle.clone());
    let checkpoints = CheckpointManager::new(handle);

    let git = Arc::new(GitHubClient::new(&config.github, &EnvCredentials)?);
    let agent = Arc::new(CliAgent::new(&config.agent));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        checkpoints,
        git,
        agent,
        config.clone(),
    ));
    Ok((orchestrator, config))
}

/// Flip the cancellation token on Ctrl-C so in-flight work can checkpoint.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Shutdown requested, finishing in-flight work...");
            cancel.cancel();
        }
    });
}

pub async fn cmd_trigger(project_dir: &Path, item: &str, label: Option<&str>) -> Result<()> {
    let (orchestrator, config) = build_engine(project_dir)?;

    let event_label = label.unwrap_or(&config.labels.trigger).to_string();
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = orchestrator
        .process(Trigger::new(item, event_label), cancel)
        .await
        .with_context(|| format!("Failed to process item {}", item))?;

    println!();
    println!(
        "{} item {}: {} -> {} ({}, status {})",
        style("Processed").green().bold(),
        summary.item_id,
        summary.stage_before,
        summary.stage_after,
        summary.outcome,
        summary.status.as_str()
    );
    println!();

    Ok(())
}

pub async fn cmd_daemon(project_dir: &Path) -> Result<()> {
    let (orchestrator, config) = build_engine(project_dir)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    println!(
        "Polling every {}s for items labeled '{}' (Ctrl-C to stop)",
        config.engine.poll_interval_secs, config.labels.trigger
    );

    let ctx = DaemonContext::new(orchestrator, config, cancel);
    run_daemon(&ctx).await?;

    Ok(())
}
