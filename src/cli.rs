use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

use scanban::config::Config;
use scanban::Daemon;

#[derive(Parser)]
#[command(name = "scanban")]
#[command(author, version, about = "access-log scanner ban daemon for nginx")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory containing nginx logs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// File to write banned IPs (nginx deny syntax)
    #[arg(long)]
    pub banned_file: Option<PathBuf>,

    /// Whitelist file for IPs that should not be banned
    #[arg(long)]
    pub whitelist_file: Option<PathBuf>,

    /// Interval in seconds for checking new bans and reloading nginx
    #[arg(long)]
    pub reload_interval: Option<u64>,

    /// Parse logs from the beginning
    #[arg(long)]
    pub parse_all: bool,

    /// Telegram Bot token for notifications
    #[arg(long)]
    pub telegram_token: Option<String>,

    /// Telegram Chat ID for notifications
    #[arg(long)]
    pub telegram_chat: Option<String>,

    /// Custom labels in JSON format (e.g. '{"server name": "edge-1"}')
    #[arg(long)]
    pub labels: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon (the default when no subcommand is given)
    Run,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    let config = apply_overrides(config, &cli)?;

    match cli.command {
        None | Some(Commands::Run) => cmd_run(config).await,
        Some(Commands::GenConfig { output }) => cmd_gen_config(output),
    }
}

/// Command-line flags win over the config file.
fn apply_overrides(mut config: Config, cli: &Cli) -> Result<Config> {
    if let Some(dir) = &cli.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(file) = &cli.banned_file {
        config.banned_file = file.clone();
    }
    if let Some(file) = &cli.whitelist_file {
        config.whitelist_file = file.clone();
    }
    if let Some(secs) = cli.reload_interval {
        config.reload_interval_secs = secs;
    }
    if cli.parse_all {
        config.parse_all = true;
    }
    if let Some(token) = &cli.telegram_token {
        config.telegram.token = token.clone();
    }
    if let Some(chat) = &cli.telegram_chat {
        config.telegram.chat_id = chat.clone();
    }
    if let Some(labels) = &cli.labels {
        config.labels = serde_json::from_str(labels).context("error parsing labels JSON")?;
    }
    Ok(config)
}

async fn cmd_run(config: Config) -> Result<()> {
    let daemon = Daemon::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal, draining...");
        let _ = shutdown_tx.send(true);
    });

    daemon.run(shutdown_rx).await
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {}", path.display());
        }
        None => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
