//! `brewline`: inspect and drive the local sync queue from a terminal.
//!
//! ```text
//! brewline [--config FILE] status
//! brewline [--config FILE] flush [KIND]
//! brewline [--config FILE] dismiss [--server] KIND ID
//! ```
//!
//! Each run is a fresh process: flags come from disk, but failure counts
//! live in the running app's memory and are not visible here.

use anyhow::{bail, Context, Result};
use brewline_core::{EntityKind, Identifier, ServerId, SyncFlag};
use brewline_sync::{EngineConfig, LogReporter, SyncEngine};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "Inspect and flush the Brewline offline sync queue", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(short, long, env = "BREWLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending sync flags stored on disk
    Status,
    /// Send pending flags now
    Flush {
        /// recipe, inventory, batch or user (all kinds when omitted)
        kind: Option<EntityKind>,
    },
    /// Drop a pending flag and keep the local state as it is
    Dismiss {
        kind: EntityKind,
        /// Client or server id of the document
        id: String,
        /// Treat ID as a server id whatever its shape
        #[arg(long)]
        server: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = SyncEngine::open(config, Arc::new(LogReporter))
        .context("failed to open the local store")?;
    let pending = engine.restore().await?;
    log::debug!("{pending} pending flag(s) on disk");

    match cli.command {
        Commands::Status => status(&engine).await,
        Commands::Flush { kind } => flush(&engine, kind).await,
        Commands::Dismiss { kind, id, server } => dismiss(&engine, kind, parse_id(&id, server)?).await,
    }
}

async fn status(engine: &SyncEngine) -> Result<()> {
    let user = engine
        .user()
        .current()
        .map(|u| u.username)
        .unwrap_or_else(|| "(signed out)".to_string());
    println!("user: {user}");

    let mut total = 0;
    for kind in EntityKind::ALL {
        for flag in engine.pending(kind).await {
            println!("{}", flag_line(&flag));
            total += 1;
        }
    }
    println!("{total} pending flag(s); failure counts are per app session and not shown");
    Ok(())
}

fn flag_line(flag: &SyncFlag) -> String {
    let origin = if flag.doc_id.is_server() { "server" } else { "client" };
    format!(
        "{:<10} {:<7} {:<38} {origin}",
        flag.doc_type.as_str(),
        flag.method.to_string(),
        flag.doc_id.as_str()
    )
}

async fn flush(engine: &SyncEngine, kind: Option<EntityKind>) -> Result<()> {
    if !engine.session().is_authenticated() {
        bail!("not signed in; sign in from the app before flushing");
    }
    engine.connectivity().set_online(true);

    let kinds = match kind {
        Some(kind) => vec![kind],
        None => EntityKind::ALL.to_vec(),
    };
    let mut failed = 0;
    for kind in kinds {
        let summary = engine.flush(kind).await?;
        println!("{kind}: {} synced, {} failed", summary.synced, summary.failed);
        failed += summary.failed;
    }
    if failed > 0 {
        bail!("{failed} flag(s) could not be sent");
    }
    Ok(())
}

/// A bare id is classified by shape; `--server` overrides that for server
/// ids that are not 24-hex.
fn parse_id(raw: &str, server: bool) -> Result<Identifier> {
    if server {
        if raw.is_empty() {
            bail!("empty server id");
        }
        return Ok(Identifier::Server(ServerId::new(raw)));
    }
    Ok(Identifier::classify(raw)?)
}

async fn dismiss(engine: &SyncEngine, kind: EntityKind, id: Identifier) -> Result<()> {
    if !engine.dismiss(kind, &id).await? {
        bail!("no pending {kind} flag for {id}");
    }
    println!("dismissed {kind} {id}");
    Ok(())
}
