// trellis-server: standalone sync server entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use trellis_server::config::ServerConfig;
use trellis_server::persist::SnapshotDb;
use trellis_server::session::SyncState;
use trellis_server::ws;

#[derive(Debug, Parser)]
#[command(name = "trellis-server", about = "Real-time synchronized document store")]
struct Args {
    /// Config file (defaults to ~/.trellis/server.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address override, e.g. 127.0.0.1:7341.
    #[arg(long)]
    listen: Option<String>,
    /// Data directory override.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Keep documents in memory only; skip the snapshot database.
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load_from(path)
            .with_context(|| format!("failed to load config from `{}`", path.display()))?,
        None => ServerConfig::load(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    let state = if args.ephemeral {
        SyncState::new()
    } else {
        match config.snapshot_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create data dir `{}`", parent.display())
                    })?;
                }
                let db = SnapshotDb::open(&path)?;
                SyncState::with_persistence(db)?
            }
            None => {
                warn!("no home directory found; running without persistence");
                SyncState::new()
            }
        }
    };
    let state = match &config.token {
        Some(token) => state.with_token(token.clone()),
        None => state,
    };

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind `{}`", config.listen))?;
    info!(listen = %config.listen, "trellis server listening");
    ws::serve(listener, state).await
}
