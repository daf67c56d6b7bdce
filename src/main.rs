use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Label-driven change lifecycle orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a foreman project (.foreman/ config and state database)
    Init,
    /// Process one trigger event for a single item
    Trigger {
        /// Item id (issue or pull request number)
        item: String,

        /// Label event that fired (defaults to the configured trigger label)
        #[arg(long)]
        label: Option<String>,
    },
    /// Poll for pending triggers and process items until interrupted
    Daemon,
    /// Show one item's state and checkpoint history
    Status { item: String },
    /// List tracked items
    List,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration
    Validate,
    /// Write a default foreman.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Trigger { item, label } => {
            cmd::cmd_trigger(&project_dir, item, label.as_deref()).await?
        }
        Commands::Daemon => cmd::cmd_daemon(&project_dir).await?,
        Commands::Status { item } => cmd::cmd_status(&project_dir, item)?,
        Commands::List => cmd::cmd_list(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "foreman=debug" } else { "foreman=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
