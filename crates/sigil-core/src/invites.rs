//! onBind delivery of pending room invites.
//!
//! Delivery is advisory. It runs on background tasks owned by a [`JoinSet`],
//! and a failure (or panic) only leaves the token in place for the next
//! retry pass. It never reaches the caller that triggered the bind.
//!
//! Every delivery for an identifier runs under that identifier's lock and
//! goes to the account bound at that moment. A token is recorded as delivered
//! before the lock is released, so concurrent binds and retry passes never
//! hand the same invite out twice.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use sigil_common::{InviteToken, Medium, SigilResult, redact::RedactionPolicy};
use sigil_db::{AssociationStore, InviteTokenStore, locks::KeyedLocks};
use sigil_federation::{NotificationTransport, OnBind};
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{debug, info, warn};

// Upper bound on tokens examined by one retry pass.
const RETRY_PAGE: u32 = 1_000;

/// Outcome of one [`InviteDelivery::retry`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub pruned: u64,
    pub delivered: usize,
    pub failed: usize,
    /// Tokens whose identifier is not bound yet.
    pub waiting: usize,
}

#[derive(Clone)]
struct Deliverer {
    tokens: Arc<dyn InviteTokenStore>,
    associations: Arc<dyn AssociationStore>,
    locks: Arc<KeyedLocks>,
    transport: Arc<dyn NotificationTransport>,
    delete_on_delivery: bool,
    validity_ms: Option<i64>,
    redaction: RedactionPolicy,
}

#[derive(Debug, Default, Clone, Copy)]
struct Delivered {
    ok: usize,
    failed: usize,
}

impl Deliverer {
    /// Deliver every pending, unexpired token for the identifier to the
    /// account it is currently bound to. `None` when nothing is bound.
    async fn deliver_pending(&self, medium: Medium, address: &str) -> SigilResult<Option<Delivered>> {
        let _guard = self.locks.lock(medium, address).await;
        let Some(association) = self.associations.get_active(medium, address).await? else {
            return Ok(None);
        };
        let tokens = self.tokens.get_tokens(medium, address).await?;
        Ok(Some(self.deliver_tokens(&tokens, &association.account_id).await))
    }

    async fn deliver_tokens(&self, tokens: &[InviteToken], account_id: &str) -> Delivered {
        let now = Utc::now().timestamp_millis();
        let mut outcome = Delivered::default();

        for token in tokens {
            if token.is_delivered() || token.is_expired(self.validity_ms, now) {
                continue;
            }
            let notification = OnBind {
                medium: token.medium,
                address: token.address.clone(),
                account_id: account_id.to_owned(),
                room_id: token.room_id.clone(),
                sender: token.sender.clone(),
                token: token.token.clone(),
            };

            if let Err(e) = self.transport.deliver_on_bind(&notification).await {
                warn!(
                    medium = %token.medium,
                    address = %self.redaction.redact(token.medium, &token.address),
                    room_id = %token.room_id,
                    "onBind delivery failed, will retry: {}", e
                );
                outcome.failed += 1;
                continue;
            }

            let recorded = if self.delete_on_delivery {
                self.tokens.delete_token(token.id).await
            } else {
                self.tokens.mark_sent(token.id, Utc::now().timestamp_millis()).await
            };
            match recorded {
                Ok(()) => outcome.ok += 1,
                Err(e) => {
                    warn!(token_id = token.id, "Delivered invite but could not record it: {}", e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}

/// Owns the background delivery tasks spawned by binds.
pub struct InviteDelivery {
    deliverer: Deliverer,
    tasks: Mutex<JoinSet<()>>,
}

impl InviteDelivery {
    pub fn new(
        tokens: Arc<dyn InviteTokenStore>,
        associations: Arc<dyn AssociationStore>,
        transport: Arc<dyn NotificationTransport>,
        delete_on_delivery: bool,
        validity_ms: Option<i64>,
        redaction: RedactionPolicy,
    ) -> Self {
        Self {
            deliverer: Deliverer {
                tokens,
                associations,
                locks: Arc::new(KeyedLocks::new()),
                transport,
                delete_on_delivery,
                validity_ms,
                redaction,
            },
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Start delivering the identifier's pending invites in the background.
    pub async fn spawn(&self, medium: Medium, address: String) {
        let deliverer = self.deliverer.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap finished tasks so the set does not grow with every bind.
        while let Some(result) = tasks.try_join_next() {
            log_task_result(result);
        }
        tasks.spawn(async move {
            match deliverer.deliver_pending(medium, &address).await {
                Ok(Some(d)) if d.ok + d.failed > 0 => {
                    info!(delivered = d.ok, failed = d.failed, "Processed pending invites on bind")
                }
                Ok(_) => {}
                Err(e) => warn!("Could not read pending invites: {}", e),
            }
        });
    }

    /// Wait for every in-flight background delivery to finish.
    pub async fn drain(&self) {
        // Taken out so binds can keep spawning while we wait.
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }
    }

    /// Prune expired invites, then re-attempt every undelivered token whose
    /// identifier is currently bound.
    pub async fn retry(&self) -> SigilResult<RetryReport> {
        let d = &self.deliverer;
        let mut report = RetryReport::default();

        if let Some(validity) = d.validity_ms {
            let cutoff = Utc::now().timestamp_millis().saturating_sub(validity);
            report.pruned = d.tokens.prune_received_before(cutoff).await?;
        }

        let mut by_identifier: BTreeMap<(Medium, String), usize> = BTreeMap::new();
        for token in d.tokens.undelivered(RETRY_PAGE).await? {
            *by_identifier.entry((token.medium, token.address)).or_default() += 1;
        }

        for ((medium, address), pending) in by_identifier {
            match d.deliver_pending(medium, &address).await? {
                Some(outcome) => {
                    report.delivered += outcome.ok;
                    report.failed += outcome.failed;
                }
                None => report.waiting += pending,
            }
        }

        if report != RetryReport::default() {
            info!(
                pruned = report.pruned,
                delivered = report.delivered,
                failed = report.failed,
                waiting = report.waiting,
                "Invite retry pass finished"
            );
        } else {
            debug!("Invite retry pass found nothing to do");
        }
        Ok(report)
    }
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!("Invite delivery task panicked: {}", e);
        }
    }
}
