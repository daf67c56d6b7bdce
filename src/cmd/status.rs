//! Item inspection commands — `foreman status`, `foreman list`.

use anyhow::Result;
use console::style;
use std::path::Path;

use foreman::config::{db_path, is_initialized};
use foreman::store::{CheckpointPayload, StateDb};

pub fn cmd_status(project_dir: &Path, item_id: &str) -> Result<()> {
    let Some(db) = open_db(project_dir)? else {
        return Ok(());
    };

    let Some(item) = db.load_item(item_id)? else {
        println!();
        println!("No record for item {}.", item_id);
        println!();
        return Ok(());
    };

    println!();
    println!("Item {}", item.id);
    println!("=======");
    println!("Stage:    {}", item.current_stage);
    println!("Status:   {}", item.status.as_str());
    println!("Version:  {}", item.version);
    if let Some(pr_id) = &item.pr_id {
        println!("PR:       {}", pr_id);
    }
    if !item.labels_snapshot.is_empty() {
        println!("Labels:   {}", item.labels_snapshot.join(", "));
    }
    if !item.retry_counts.is_empty() {
        let counts: Vec<String> = item
            .retry_counts
            .iter()
            .map(|(stage, n)| format!("{}={}", stage, n))
            .collect();
        println!("Retries:  {}", counts.join(", "));
    }
    if item.fix_attempts > 0 {
        println!("Fixes:    {}", item.fix_attempts);
    }
    println!("Updated:  {}", item.updated_at.to_rfc3339());

    let checkpoints = db.list_checkpoints(item_id)?;
    if !checkpoints.is_empty() {
        println!();
        println!("Checkpoints:");
        for cp in &checkpoints {
            let detail = match &cp.payload {
                CheckpointPayload::StageOutcome { outcome, next_stage, .. } => match next_stage {
                    Some(next) => format!("{} -> {}", outcome, next),
                    None => outcome.clone(),
                },
                CheckpointPayload::PlanSnapshot { plan } => {
                    let done = plan
                        .tasks
                        .iter()
                        .filter(|t| t.status == foreman::plan::TaskStatus::Succeeded)
                        .count();
                    format!("plan rev {} ({}/{} tasks done)", plan.revision, done, plan.tasks.len())
                }
                CheckpointPayload::RecoveryDecision { strategy, escalate, .. } => {
                    if *escalate {
                        format!("recovery: {} (escalated)", strategy)
                    } else {
                        format!("recovery: {}", strategy)
                    }
                }
            };
            println!(
                "  {:>4}  {:<16} {}",
                cp.seq,
                cp.stage.key(),
                style(detail).dim()
            );
        }
    }
    println!();

    Ok(())
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    let Some(db) = open_db(project_dir)? else {
        return Ok(());
    };

    let items = db.list_items()?;
    if items.is_empty() {
        println!();
        println!("No tracked items.");
        println!();
        return Ok(());
    }

    println!();
    println!("{:<10} {:<16} {:<16} {:<8} Updated", "Item", "Stage", "Status", "Ver");
    for item in &items {
        println!(
            "{:<10} {:<16} {:<16} {:<8} {}",
            item.id,
            item.current_stage.key(),
            item.status.as_str(),
            item.version,
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();

    Ok(())
}

fn open_db(project_dir: &Path) -> Result<Option<StateDb>> {
    if !is_initialized(project_dir) {
        println!();
        println!("Project is not initialized. Run 'foreman init' first.");
        println!();
        return Ok(None);
    }
    Ok(Some(StateDb::new(&db_path(project_dir))?))
}
