//! Configuration view and validation commands — `foreman config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;
use foreman::config::{ForemanConfig, config_path, foreman_dir};

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let path = config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();

            if path.exists() {
                println!("Config file: {}", path.display());
                println!();
                let config = ForemanConfig::load(&path)?;
                print!("{}", config.to_toml()?);
            } else {
                println!("No foreman.toml found at {}", path.display());
                println!();
                println!("Default configuration:");
                print!("{}", ForemanConfig::default().to_toml()?);
                println!();
                println!("Run 'foreman config init' to create a foreman.toml file.");
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            if !path.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                println!();
                return Ok(());
            }

            let config = ForemanConfig::load(&path)?;
            match config.validate() {
                Ok(()) => println!("Configuration is valid."),
                Err(e) => println!("Configuration is invalid: {}", e),
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                println!("foreman.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            let dir = foreman_dir(project_dir);
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }

            std::fs::write(&path, ForemanConfig::default().to_toml()?)?;

            println!("Created foreman.toml at {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] concurrency bounds, timeouts, poll interval");
            println!("  - [recovery] retry bounds and backoff curve");
            println!("  - [labels] trigger / approved / needs-human vocabulary");
            println!("  - [github] repo slug, [agent] command");
            println!();
        }
    }

    Ok(())
}
