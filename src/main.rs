// ABOUTME: CLI entry point for database-tailer
// ABOUTME: Parses commands and routes to run, check and positions handlers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use database_tailer::config::TailerConfig;
use database_tailer::position::PositionStore;
use database_tailer::{db, JsonLinesSink, Poller, TableRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "database-tailer")]
#[command(about = "Tail new rows from relational tables into a JSON record stream", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured tables and write records to stdout as JSON lines
    Run {
        /// Path to the TOML configuration file
        #[arg(long, env = "DATABASE_TAILER_CONFIG")]
        config: PathBuf,
    },
    /// Validate every configured table against the live schema
    Check {
        #[arg(long, env = "DATABASE_TAILER_CONFIG")]
        config: PathBuf,
    },
    /// Show checkpoint files without connecting to the database
    Positions {
        #[arg(long, env = "DATABASE_TAILER_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // Logs go to stderr; stdout carries records
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Check { config } => check(&config).await,
        Commands::Positions { config } => positions(&config),
    }
}

async fn run(path: &Path) -> Result<()> {
    let config = TailerConfig::load(path)?;
    let executor = db::connect(&config.source)
        .await
        .context("Failed to open source database")?;

    let (registry, failures) = TableRegistry::open(executor, &config).await;
    for (table, e) in &failures {
        tracing::warn!("Table '{}' will not be polled: {}", table, e);
    }
    if registry.is_empty() {
        anyhow::bail!("No table could be registered; nothing to poll");
    }

    let poller = Poller::new(Arc::new(registry), Arc::new(JsonLinesSink));

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                let _ = shutdown_tx_clone.send(());
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    tracing::info!("Press Ctrl+C to stop");
    poller.run(shutdown_rx).await
}

async fn check(path: &Path) -> Result<()> {
    let config = TailerConfig::load(path)?;
    let executor = db::connect(&config.source)
        .await
        .context("Failed to open source database")?;

    let (registry, failures) = TableRegistry::open(executor, &config).await;

    println!();
    println!("========================================");
    println!("Table check");
    println!("========================================");
    for table in registry.tables() {
        let mode = match &table.descriptor().cursor().identity {
            Some(identity) => format!("partitioned by '{}'", identity),
            None => "single cursor".to_string(),
        };
        println!(
            "  OK    {} (alias '{}', increment '{}', {})",
            table.name(),
            table.alias(),
            table.descriptor().cursor().increment,
            mode
        );
    }
    for (table, e) in &failures {
        println!("  FAIL  {}: {}", table, e);
    }
    println!();

    if !failures.is_empty() {
        anyhow::bail!("{} of {} tables failed validation", failures.len(), config.tables.len());
    }
    Ok(())
}

fn positions(path: &Path) -> Result<()> {
    let config = TailerConfig::load(path)?;
    let store = PositionStore::new(config.poller.checkpoint_root());
    let catalog = catalog_hint(&config.source.url);

    println!("Checkpoint root: {}", store.root().display());
    for table in &config.tables {
        let file = store.path(&catalog, &table.name);
        match store.load_raw(&catalog, &table.name) {
            Ok(Some(contents)) => println!("{}\t{}\t{}", table.name, file.display(), contents),
            Ok(None) => println!("{}\t{}\t<none>", table.name, file.display()),
            Err(e) => println!("{}\t{}\t<unreadable: {}>", table.name, file.display(), e),
        }
    }
    Ok(())
}

/// Catalog name an executor would report for the URL, derived offline.
fn catalog_hint(url: &str) -> String {
    if let Some(path) = url.strip_prefix("sqlite://") {
        return Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());
    }
    match url::Url::parse(url) {
        Ok(parsed) => {
            let database = parsed.path().trim_start_matches('/');
            if database.is_empty() {
                parsed.username().to_string()
            } else {
                database.to_string()
            }
        }
        Err(_) => "default".to_string(),
    }
}
