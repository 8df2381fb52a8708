//! Per-peer replication loop.
//!
//! Each configured peer gets its own pusher task. A pusher reads its cursor,
//! ships the next batch of already-signed log entries, and advances the cursor
//! only when the peer acknowledges exactly the batch's last sequence number.
//! Any failure leaves the cursor in place and the batch is retried after an
//! exponential backoff, indefinitely. Shutdown is observed between batches
//! and while idle, never in the middle of a transmission.

use std::{sync::Arc, time::Duration};

use rand::Rng as _;
use sigil_common::{SigilError, SigilResult, config::{PeerConfig, ReplicationConfig}};
use sigil_db::{AssociationStore, repository::cursors};
use sigil_federation::{FederationError, PeerTransport, ReplicationBatch};
use sqlx::SqlitePool;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): the capped exponential
    /// step, jittered down to somewhere in its upper half.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let step = self.base.saturating_mul(1u32 << exponent).min(self.max);
        let millis = u64::try_from(step.as_millis()).unwrap_or(u64::MAX);
        if millis < 2 {
            return step;
        }
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}

#[derive(Debug, Clone)]
pub struct PusherSettings {
    /// Our server name, stamped on every batch as its origin.
    pub origin: String,
    pub batch_limit: u32,
    pub poll_interval: Duration,
    pub backoff: Backoff,
}

impl PusherSettings {
    pub fn from_config(origin: &str, config: &ReplicationConfig) -> Self {
        Self {
            origin: origin.to_owned(),
            batch_limit: config.batch_limit,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            backoff: Backoff {
                base: Duration::from_millis(config.backoff_base_ms),
                max: Duration::from_millis(config.backoff_max_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A batch was acknowledged and the cursor now sits at `through`.
    Pushed { records: usize, through: i64 },
    CaughtUp,
}

pub struct ReplicationPusher {
    peer: PeerConfig,
    settings: PusherSettings,
    pool: SqlitePool,
    associations: Arc<dyn AssociationStore>,
    transport: Arc<dyn PeerTransport>,
    wake: Arc<Notify>,
}

impl ReplicationPusher {
    pub fn new(
        peer: PeerConfig,
        settings: PusherSettings,
        pool: SqlitePool,
        associations: Arc<dyn AssociationStore>,
        transport: Arc<dyn PeerTransport>,
        wake: Arc<Notify>,
    ) -> Self {
        Self { peer, settings, pool, associations, transport, wake }
    }

    /// Ship at most one batch.
    pub async fn push_once(&self) -> SigilResult<PushOutcome> {
        let cursor = cursors::get(&self.pool, &self.peer.name).await?;
        let changes = self.associations.changes_since(cursor, self.settings.batch_limit).await?;
        if changes.is_empty() {
            return Ok(PushOutcome::CaughtUp);
        }

        let batch = ReplicationBatch::from_changes(&self.settings.origin, &changes)?;
        let Some(last) = batch.last_sequence_no() else {
            return Ok(PushOutcome::CaughtUp);
        };
        debug!(peer = %self.peer.name, from = cursor, through = last, "Pushing batch");

        let ack = self.transport.push_batch(&self.peer, &batch).await?;
        if ack.last_sequence_applied != last {
            return Err(SigilError::from(FederationError::RemoteProtocol(
                self.peer.name.clone(),
                format!("acknowledged {} but batch ended at {}", ack.last_sequence_applied, last),
            )));
        }

        cursors::advance(&self.pool, &self.peer.name, last).await?;
        Ok(PushOutcome::Pushed { records: batch.records.len(), through: last })
    }

    /// Push until `shutdown` turns true (or its sender goes away).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(peer = %self.peer.name, endpoint = %self.peer.endpoint, "Replication pusher started");
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.push_once().await {
                Ok(PushOutcome::Pushed { records, through }) => {
                    attempt = 0;
                    info!(peer = %self.peer.name, records, through, "Replicated batch");
                }
                Ok(PushOutcome::CaughtUp) => {
                    attempt = 0;
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.settings.backoff.delay(attempt);
                    warn!(
                        peer = %self.peer.name,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Replication push failed: {}", e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(peer = %self.peer.name, "Replication pusher stopped");
    }
}
