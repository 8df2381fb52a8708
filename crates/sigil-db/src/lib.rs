//! # sigil-db
//!
//! Storage layer for Sigil. Everything lives in one SQLite database:
//! - **associations**: local bindings and tombstones, the replication log
//! - **invite_tokens**: pending room invites keyed by identifier
//! - **peer_cursors**: per-peer replication progress
//! - **signing_keys**: this server's Ed25519 keys, current and retired
//! - **replicated_associations**: bindings received from peers

pub mod locks;
pub mod repository;
pub mod store;

use std::{str::FromStr, time::Duration};

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

pub use repository::{
    associations::SqlAssociationStore, invite_tokens::SqlInviteTokenStore,
    replicated::{ReplicatedAssociation, ReplicatedAssociationStore},
    signing_keys::StoredSigningKey,
};
pub use store::{AssociationStore, InviteTokenStore};

/// Shared database handle. Cloning is cheap; the pool is reference-counted.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database named in the config.
    pub async fn connect(config: &sigil_common::config::AppConfig) -> Result<Self> {
        tracing::info!("Opening SQLite database at {}", config.database.url);
        let opts = SqliteConnectOptions::from_str(&config.database.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect_with(opts)
            .await?;

        tracing::info!("Connected to SQLite");
        Ok(Self { pool })
    }

    /// A private, migrated in-memory database.
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to one connection that never expires.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}
