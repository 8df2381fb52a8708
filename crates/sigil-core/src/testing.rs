//! Fakes shared by the unit tests of this crate.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sigil_common::config::PeerConfig;
use sigil_db::Database;
use sigil_federation::{
    ClaimedSignature, DbKeyManager, FederationError, FederationVerifier, NotificationTransport,
    OnBind, PeerTransport, ReplicationAck, ReplicationBatch,
};

pub(crate) const SERVER_NAME: &str = "id.example.org";

pub(crate) async fn database_and_keys() -> (Database, Arc<DbKeyManager>) {
    let db = Database::connect_in_memory().await.unwrap();
    let keys = DbKeyManager::load_or_generate(db.pool.clone(), None).await.unwrap();
    (db, Arc::new(keys))
}

/// Records every onBind notification; fails while `failing` is set and
/// takes `delay_ms` to answer.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub delivered: Mutex<Vec<OnBind>>,
    pub failing: AtomicBool,
    pub delay_ms: AtomicU64,
}

impl RecordingNotifier {
    pub fn delivered(&self) -> Vec<OnBind> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingNotifier {
    async fn deliver_on_bind(&self, notification: &OnBind) -> Result<(), FederationError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(FederationError::RemoteHttp("hs.example.org".into(), "503".into()));
        }
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Approves exactly the signatures whose `sig` equals `accepted_sig`.
pub(crate) struct FixedVerifier {
    pub accepted_sig: String,
    pub seen_payloads: Mutex<Vec<Vec<u8>>>,
}

impl FixedVerifier {
    pub fn accepting(sig: &str) -> Self {
        Self { accepted_sig: sig.into(), seen_payloads: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl FederationVerifier for FixedVerifier {
    async fn verify_identity_ownership(
        &self,
        _account_id: &str,
        claimed: &ClaimedSignature,
        payload: &[u8],
    ) -> bool {
        self.seen_payloads.lock().unwrap().push(payload.to_vec());
        claimed.sig == self.accepted_sig
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerBehaviour {
    AckAll,
    AckShort,
    Fail,
}

/// Records pushed batches and acks according to `behaviour`.
pub(crate) struct ScriptedPeer {
    pub behaviour: Mutex<PeerBehaviour>,
    pub batches: Mutex<Vec<ReplicationBatch>>,
}

impl ScriptedPeer {
    pub fn new(behaviour: PeerBehaviour) -> Self {
        Self { behaviour: Mutex::new(behaviour), batches: Mutex::new(Vec::new()) }
    }

    pub fn set(&self, behaviour: PeerBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn batches(&self) -> Vec<ReplicationBatch> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for ScriptedPeer {
    async fn push_batch(
        &self,
        peer: &PeerConfig,
        batch: &ReplicationBatch,
    ) -> Result<ReplicationAck, FederationError> {
        self.batches.lock().unwrap().push(batch.clone());
        let last = batch.last_sequence_no().unwrap_or_default();
        match *self.behaviour.lock().unwrap() {
            PeerBehaviour::AckAll => Ok(ReplicationAck { last_sequence_applied: last }),
            PeerBehaviour::AckShort => Ok(ReplicationAck { last_sequence_applied: last - 1 }),
            PeerBehaviour::Fail => {
                Err(FederationError::RemoteHttp(peer.name.clone(), "connection reset".into()))
            }
        }
    }
}

pub(crate) fn peer(name: &str) -> PeerConfig {
    PeerConfig {
        name: name.into(),
        endpoint: format!("https://{name}:4434"),
        verify_key: String::new(),
    }
}
