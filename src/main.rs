//! DePIN Governance Engine Entry Point
//!
//! Runs the governance engine as a daemon: the proposal execution queue
//! driver and the deadline sweeper, over a SQLite (or in-memory) store.
//! The HTTP/WebSocket layer talks to the same database.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration
//! depin-governance
//!
//! # Run with a config file (TOML or YAML)
//! depin-governance --config governance.toml run
//!
//! # Write a default config file
//! depin-governance init-config governance.toml
//!
//! # Inspect a DAO
//! depin-governance ranking dao_1f2e3d4c5b6a7988 --role council
//! depin-governance proposals --dao dao_1f2e3d4c5b6a7988 --status passed --type treasury
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use depin_governance::config::{Config, StorageBackend};
use depin_governance::engine::open_store;
use depin_governance::notifier::LogBroadcaster;
use depin_governance::types::{MemberRole, ProposalStatus, ProposalType, RecordFilter, StatusLabel};
use depin_governance::GovernanceEngine;

/// DePIN Governance Engine
#[derive(Parser, Debug)]
#[command(name = "depin-governance")]
#[command(author = "AEGIS Team")]
#[command(version = "0.1.0")]
#[command(about = "DAO governance engine for DePIN dashboards", long_about = None)]
struct Args {
    /// Path to configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use an in-memory store instead of SQLite
    #[arg(long)]
    memory: bool,

    /// Override the SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the execution queue and deadline sweeper until Ctrl-C
    Run,

    /// Write a default configuration file
    InitConfig {
        /// Output path
        #[arg(default_value = "governance.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// List DAOs with their treasury balance
    Daos,

    /// Show the voting-power leaderboard of a DAO
    Ranking {
        /// DAO id
        dao_id: String,

        /// Only members with this role (admin, council, member, observer)
        #[arg(long)]
        role: Option<MemberRole>,
    },

    /// List proposals
    Proposals {
        /// Only proposals of this DAO
        #[arg(long)]
        dao: Option<String>,

        /// Only proposals in this status (draft, active, passed, ...)
        #[arg(long)]
        status: Option<ProposalStatus>,

        /// Only proposals of this type (treasury, investment, governance, membership)
        #[arg(long = "type")]
        kind: Option<ProposalType>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if args.memory {
        config.storage.backend = StorageBackend::Memory;
    }
    if let Some(db) = &args.db {
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.sqlite_path = db.clone();
    }

    init_logging(&config, args.verbose)?;
    config.validate().context("Invalid configuration")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::InitConfig { path, force } => init_config(&config, path, force),
        Command::Daos => list_daos(config).await,
        Command::Ranking { dao_id, role } => show_ranking(config, &dao_id, role).await,
        Command::Proposals { dao, status, kind } => list_proposals(config, dao, status, kind).await,
    }
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(&config.logging.filter)
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn build_engine(config: Config) -> anyhow::Result<GovernanceEngine> {
    let store = open_store(&config.storage).context("Failed to open governance store")?;
    Ok(GovernanceEngine::new(config, store, Arc::new(LogBroadcaster)))
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting DePIN governance engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Engine configuration:");
    info!(
        "  Queue: delay {}s, retry delay {}s, max retries {}",
        config.queue.execution_delay_secs, config.queue.retry_delay_secs, config.queue.max_retries
    );
    info!(
        "  Workflow: auto payouts {}, auto enqueue {}, sweep every {}s",
        config.workflow.auto_execute_payouts,
        config.workflow.auto_enqueue_passed,
        config.workflow.sweep_interval_secs
    );
    match config.storage.backend {
        StorageBackend::Memory => info!("  Storage: in-memory"),
        StorageBackend::Sqlite => info!("  Storage: {}", config.storage.sqlite_path.display()),
    }

    let engine = build_engine(config)?;
    engine.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    engine.shutdown().await;
    Ok(())
}

fn init_config(config: &Config, path: PathBuf, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    config
        .to_file(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!(
        "{}",
        format!("✓ Configuration written to {}", path.display()).green()
    );
    Ok(())
}

async fn list_daos(config: Config) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    let daos = engine.dao().daos().await?;

    if daos.is_empty() {
        println!("{}", "No DAOs found.".yellow());
        return Ok(());
    }

    println!(
        "{:<24} {:<30} {:>16} {}",
        "ID".bold(),
        "NAME".bold(),
        "TREASURY".bold(),
        "MEMBERS".bold()
    );
    println!("{}", "-".repeat(80));

    for dao in daos {
        let members = engine.dao().members(&dao.id).await?;
        println!(
            "{:<24} {:<30} {:>16} {}",
            dao.id.bright_white(),
            dao.name,
            dao.treasury_balance,
            members.len().to_string().dimmed()
        );
    }
    Ok(())
}

async fn show_ranking(config: Config, dao_id: &str, role: Option<MemberRole>) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    let ranking = engine.dao().ranking(dao_id).await?;

    println!("{}", format!("Voting power ranking for {}", dao_id).bright_cyan().bold());
    println!();
    println!(
        "{:<6} {:<24} {:<10} {:>12} {:>12}",
        "RANK".bold(),
        "MEMBER".bold(),
        "ROLE".bold(),
        "POWER".bold(),
        "SCORE".bold()
    );
    println!("{}", "-".repeat(68));

    for entry in ranking {
        if role.is_some_and(|r| entry.member.role != r) {
            continue;
        }
        println!(
            "{:<6} {:<24} {:<10} {:>12} {:>12}",
            entry.rank,
            entry.member.user_id.bright_white(),
            entry.member.role.to_string(),
            entry.member.voting_power.to_string().green(),
            entry.member.contribution_score
        );
    }
    Ok(())
}

async fn list_proposals(
    config: Config,
    dao: Option<String>,
    status: Option<ProposalStatus>,
    kind: Option<ProposalType>,
) -> anyhow::Result<()> {
    let filter = RecordFilter { dao_id: dao, status };

    let engine = build_engine(config)?;
    let mut proposals = engine.proposals().list(&filter).await?;
    if let Some(kind) = kind {
        proposals.retain(|p| p.proposal_type == kind);
    }

    if proposals.is_empty() {
        println!("{}", "No proposals found.".yellow());
        return Ok(());
    }

    println!(
        "{:<22} {:<12} {:<11} {:>10} {:>10} {}",
        "ID".bold(),
        "TYPE".bold(),
        "STATUS".bold(),
        "YES".bold(),
        "NO".bold(),
        "TITLE".bold()
    );
    println!("{}", "-".repeat(90));

    for proposal in proposals {
        let status = match proposal.status {
            ProposalStatus::Executed | ProposalStatus::Passed => proposal.status.as_str().green(),
            ProposalStatus::Failed | ProposalStatus::Defeated => proposal.status.as_str().red(),
            ProposalStatus::Cancelled => proposal.status.as_str().dimmed(),
            _ => proposal.status.as_str().yellow(),
        };
        println!(
            "{:<22} {:<12} {:<11} {:>10} {:>10} {}",
            proposal.id.bright_white(),
            proposal.proposal_type.to_string(),
            status,
            proposal.tally.yes,
            proposal.tally.no,
            proposal.title
        );
    }
    Ok(())
}
