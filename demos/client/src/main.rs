//! Bridge client.
//!
//! Run with: cargo run -p tether-client -- --server-url ws://127.0.0.1:8765
//!
//! Configuration comes from an optional TOML file, `TETHER_*` environment
//! variables and the flags below, in increasing priority. On unix, SIGHUP
//! re-reads the file and applies it to the running session.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tether_core::{ConfigHandle, ResourceLockTable, TetherConfig};
use tether_executor::{EXECUTE_KINDS, ExecuteHandler, Executor};
use tether_session::{SessionIdentity, storage::FileIdentityStore};
use tether_transport::{MessageRouter, Session};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "tether-client", about = "Keep a tether session open and run controller commands")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Controller address, overriding the configuration.
    #[arg(long)]
    server_url: Option<String>,

    /// Permit `unsafe: true` commands.
    #[arg(long)]
    allow_full_trust: bool,
}

impl Args {
    fn load(&self) -> anyhow::Result<TetherConfig> {
        let mut config =
            TetherConfig::load(self.config.as_deref()).context("loading configuration")?;
        if let Some(url) = &self.server_url {
            config.server_url.clone_from(url);
        }
        if self.allow_full_trust {
            config.allow_full_trust = true;
        }
        config.validate().context("validating configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.load()?;

    let store = match &config.identity_path {
        Some(path) => FileIdentityStore::new(path),
        None => FileIdentityStore::in_data_dir().context("locating identity file")?,
    };
    let identity = SessionIdentity::get_or_create(&store).await;
    if !identity.is_durable() {
        tracing::warn!(
            path = %store.path().display(),
            "Identity not persisted; a new one will be issued next run"
        );
    }

    let locks = Arc::new(ResourceLockTable::new(config.lock_ttl()));
    let config = ConfigHandle::new(config);
    let executor = Arc::new(Executor::new(config.clone(), locks));

    let router = Arc::new(MessageRouter::new());
    let handler = Arc::new(ExecuteHandler::new(Arc::clone(&executor)));
    for kind in EXECUTE_KINDS {
        router.register(*kind, handler.clone());
    }
    router.on_disconnect(move || {
        let failed = executor.fail_all_connection_lost();
        if failed > 0 {
            tracing::warn!(failed, "Failed running executions after connection loss");
        }
    });

    let session = Session::start(config.clone(), identity, router);
    tracing::info!(session_id = %identity, "Client started");

    let reloader = tokio::spawn(reload_on_hangup(args, config));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Shutting down");
    reloader.abort();
    session.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn reload_on_hangup(args: Args, config: ConfigHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!(error = %e, "Config reload unavailable");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        match args.load() {
            Ok(fresh) => {
                if config.update(|current| *current = fresh) {
                    tracing::info!("Configuration reloaded");
                }
            }
            Err(e) => tracing::error!(error = %format!("{e:#}"), "Config reload failed"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_args: Args, _config: ConfigHandle) {}
