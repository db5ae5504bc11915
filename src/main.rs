//! vaultsock CLI - serves Vault secrets over per-secret Unix sockets.
//!
//! This is the main binary entry point. See the `vaultsock` library for
//! the core functionality.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use vaultsock::store::vault::VaultClient;
use vaultsock::supervisor::ShutdownSignal;
use vaultsock::{Config, Supervisor};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "vaultsock")]
#[command(version)]
#[command(about = "Serve Vault secrets to local processes over Unix domain sockets")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, global = true, default_value = "config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind every configured socket and serve until SIGINT/SIGTERM (default)
    Serve,
    /// Validate the configuration and print the resolved socket paths
    Check,
}

/// Log to stderr, or to `VAULTSOCK_LOG_FILE` when set.
fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("VAULTSOCK_LOG_FILE") {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("Error reading configuration")?;
    let store = VaultClient::from_config(&config).context("Error configuring Vault client")?;

    // Before any socket exists, so an early interrupt still drains.
    let shutdown = ShutdownSignal::register()?;

    log::info!(
        "vaultsock v{} serving {} secret(s) from {} (mount {}) under {}",
        env!("CARGO_PKG_VERSION"),
        config.secrets.len(),
        config.vault_address(),
        config.vault_mount,
        config.socket_root.display()
    );

    let report = Supervisor::new(&config, Arc::new(store))
        .run(shutdown.recv())
        .await;

    if !report.failed.is_empty() {
        log::warn!(
            "{} socket file(s) could not be removed",
            report.failed.len()
        );
    }
    log::info!("Shutdown complete");
    Ok(())
}

fn check(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path).context("Error reading configuration")?;

    println!("Vault:       {} (mount {})", config.vault_address(), config.vault_mount);
    println!("Socket root: {}", config.socket_root.display());
    for secret in &config.secrets {
        let target = match secret.field() {
            Some(field) => format!("{}#{field}", secret.vault_path),
            None => secret.vault_path.clone(),
        };
        println!("  {} -> {target}", config.socket_path_for(secret).display());
    }
    println!("{} secret(s) OK", config.secrets.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&cli.config).await?,
        Commands::Check => check(&cli.config)?,
    }

    Ok(())
}
