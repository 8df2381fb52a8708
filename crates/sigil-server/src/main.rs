//! # Sigil Server
//!
//! Main binary. `sigil run` (the default) wires the stores, the key manager,
//! the federation client and the binder together, then supervises the
//! background work:
//! - one replication pusher per configured peer
//! - the periodic retry pass for undelivered invites
//!
//! The remaining subcommands manage this server's signing keys.

use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use sigil_common::config::{AppConfig, LogFormat};
use sigil_core::{
    BinderSettings, InviteDelivery, PusherSettings, ReplicationPusher, ReplicationSignal,
    ThreepidBinder,
};
use sigil_db::{Database, SqlAssociationStore, SqlInviteTokenStore};
use sigil_federation::{DbKeyManager, FederationClient, KeyManager, RemoteKeyVerifier};
use tokio::{
    sync::watch,
    task::JoinSet,
    time::MissedTickBehavior,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sigil", version, about = "Third-party identifier binding and replication")]
struct Cli {
    /// Path to a TOML config file (extension optional).
    #[arg(short, long, env = "SIGIL_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background services until interrupted.
    Run,
    /// Generate a new signing key and make it current.
    RotateKey,
    /// Delete a retired signing key.
    PruneKey { key_id: String },
    /// Print the key document this server publishes.
    KeyDocument,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = sigil_common::config::init(cli.config.as_deref())?;
    init_tracing(config);

    let db = Database::connect(config).await?;
    db.migrate().await?;

    // Load the signing keys, or generate + persist the first one on first run.
    let keys = Arc::new(
        DbKeyManager::load_or_generate(
            db.pool.clone(),
            config.crypto.ed25519_signing_key.as_deref(),
        )
        .await?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, db, keys).await,
        Command::RotateKey => {
            let key_id = keys.rotate().await?;
            println!("{key_id}");
            Ok(())
        }
        Command::PruneKey { key_id } => {
            if keys.prune(&key_id).await? {
                tracing::info!("Pruned {}", key_id);
            } else {
                tracing::warn!("No stored key {}", key_id);
            }
            Ok(())
        }
        Command::KeyDocument => {
            let doc = keys.key_document(&config.server.name)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));

    match config.log.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init(),
    }
}

async fn run(config: &'static AppConfig, db: Database, keys: Arc<DbKeyManager>) -> anyhow::Result<()> {
    tracing::info!("Starting Sigil v{} as {}", env!("CARGO_PKG_VERSION"), config.server.name);
    let (key_id, _) = keys.current_public_key();
    tracing::info!("Signing with {}", key_id);

    let client = Arc::new(FederationClient::new(config, keys.clone())?);
    let verifier = Arc::new(RemoteKeyVerifier::new(client.clone()));
    let associations = Arc::new(SqlAssociationStore::new(db.pool.clone()));
    let tokens = Arc::new(SqlInviteTokenStore::new(db.pool.clone()));
    let signal = ReplicationSignal::new();

    let invites = InviteDelivery::new(
        tokens,
        associations.clone(),
        client.clone(),
        config.invites.delete_tokens_on_bind,
        config.invites.validity_ms()?,
        config.redaction.policy(),
    );
    let binder = Arc::new(ThreepidBinder::new(
        BinderSettings::from_config(config)?,
        keys,
        associations.clone(),
        verifier,
        invites,
        signal.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // === Replication pushers ===
    for peer in &config.replication.peers {
        let pusher = ReplicationPusher::new(
            peer.clone(),
            PusherSettings::from_config(&config.server.name, &config.replication),
            db.pool.clone(),
            associations.clone(),
            client.clone(),
            signal.subscribe(),
        );
        tasks.spawn(pusher.run(shutdown_rx.clone()));
    }
    if config.replication.peers.is_empty() {
        tracing::info!("No replication peers configured");
    }

    // === Invite retries ===
    let every = Duration::from_secs(config.invites.retry_interval_secs.max(1));
    tasks.spawn(invite_retry_loop(binder.clone(), every, shutdown_rx));

    shutdown_signal().await;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!("Background task failed: {}", e);
        }
    }
    binder.drain().await;
    tracing::info!("Stopped");
    Ok(())
}

async fn invite_retry_loop(
    binder: Arc<ThreepidBinder>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if let Err(e) = binder.retry_undelivered_invites().await {
            tracing::warn!("Invite retry pass failed: {}", e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Could not listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
