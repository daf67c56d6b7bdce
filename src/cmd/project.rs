//! Project initialization — `foreman init`.

use anyhow::Result;
use std::path::Path;

use foreman::config::{ForemanConfig, config_path, db_path, foreman_dir, is_initialized};
use foreman::store::StateDb;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    if is_initialized(project_dir) {
        println!();
        println!(
            "Project already initialized ({} exists).",
            config_path(project_dir).display()
        );
        println!();
        return Ok(());
    }

    let dir = foreman_dir(project_dir);
    std::fs::create_dir_all(&dir)?;

    let config = ForemanConfig::default();
    std::fs::write(config_path(project_dir), config.to_toml()?)?;

    // Open once so the schema exists before the first trigger.
    StateDb::new(&db_path(project_dir))?;

    println!();
    println!("Initialized foreman project in {}", dir.display());
    println!();
    println!("Next steps:");
    println!("  1. Set github.repo in {}", config_path(project_dir).display());
    println!("  2. Export GITHUB_TOKEN");
    println!(
        "  3. Label an issue '{}' and run 'foreman daemon' (or 'foreman trigger <id>')",
        config.labels.trigger
    );
    println!();

    Ok(())
}
