use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flowkeeper::agent::{Agent, Mode};
use flowkeeper::config::Config;
use flowkeeper::migrate::{ClickHouseMigrator, Migrator};

/// Network flow tracking, export and ClickHouse ingestion.
#[derive(Parser)]
#[command(name = "flowkeeper", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level. Overrides the config file's log_level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track connections and export flow records to an aggregator.
    Agent,
    /// Receive flow records and commit them to ClickHouse.
    Aggregator,
    /// Run agent and aggregator in one process.
    Standalone,
    /// Apply or roll back the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Print the current schema version.
    Status,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mode = match &cli.command {
        Command::Version => {
            println!("flowkeeper {}", version::full());
            return Ok(());
        }
        Command::Agent => Some(Mode::Agent),
        Command::Aggregator => Some(Mode::Aggregator),
        Command::Standalone => Some(Mode::Standalone),
        Command::Migrate { .. } => None,
    };

    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flowkeeper",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match (mode, cli.command) {
        (Some(mode), _) => rt.block_on(run(cfg, mode)),
        (None, Command::Migrate { action }) => rt.block_on(migrate(cfg, action)),
        (None, _) => Ok(()),
    }
}

async fn run(cfg: Config, mode: Mode) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg, mode)?;
    if let Err(e) = agent.start().await {
        agent.stop().await?;
        return Err(e);
    }

    let _ = shutdown_rx.await;

    agent.stop().await
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let pool = clickhouse_rs::Pool::new(cfg.aggregator.clickhouse.dsn()?);
    let migrator = ClickHouseMigrator::new(pool);

    match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version}, dirty: {dirty}");
            Ok(())
        }
    }
}
