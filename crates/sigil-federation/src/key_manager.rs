//! DB-backed server signing key management.
//!
//! On startup, `DbKeyManager::load_or_generate` reads every row of
//! `signing_keys`. If the table is empty (first run), it imports the configured
//! seed or generates a fresh Ed25519 pair, persists it, and only then returns,
//! so nothing is ever signed with a key that could be lost on restart.
//!
//! # Key rotation
//! `rotate` persists a new key at the next version and makes it current.
//! Older keys keep verifying until `prune` removes them; the current key can
//! never be pruned.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{Duration, Utc};
use sigil_db::{StoredSigningKey, repository::signing_keys};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::FederationError,
    keys::{self, ALGORITHM, ServerKeyPair},
    signatures,
    types::{OldVerifyKey, ServerKeys, VerifyKey},
};

// How long remote servers may cache our key document.
const KEY_DOCUMENT_TTL_HOURS: i64 = 24;

/// A detached signature and the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySignature {
    pub key_id: String,
    pub signature: String,
}

/// Signs with the current key and verifies with any known key.
pub trait KeyManager: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<KeySignature, FederationError>;

    /// Check `signature` over `payload` with the key named `key_id`, current
    /// or retired. Unknown key IDs never verify.
    fn verify(&self, payload: &[u8], signature: &str, key_id: &str) -> bool;

    /// `(key_id, unpadded base64 public key)` of the signing key.
    fn current_public_key(&self) -> (String, String);
}

struct KeyRing {
    current: Arc<ServerKeyPair>,
    all: BTreeMap<String, Arc<ServerKeyPair>>,
    retired_at: BTreeMap<String, i64>,
}

impl KeyRing {
    fn from_rows(rows: &[StoredSigningKey]) -> Result<Self, FederationError> {
        let mut all = BTreeMap::new();
        let mut retired_at = BTreeMap::new();
        let mut current = None;
        let mut awaiting_successor: Option<String> = None;

        for row in rows {
            if row.algorithm != ALGORITHM {
                warn!(
                    "Skipping signing key version {} with unknown algorithm {}",
                    row.version, row.algorithm
                );
                continue;
            }
            let kp = Arc::new(ServerKeyPair::from_seed(row.version, &row.seed_bytes)?);
            // Rows come in version order; a key retired when its successor was created.
            if let Some(prev_id) = awaiting_successor.take() {
                retired_at.insert(prev_id, row.created_at);
            }
            if row.is_current {
                current = Some(kp.clone());
            } else {
                awaiting_successor = Some(kp.key_id.clone());
            }
            all.insert(kp.key_id.clone(), kp);
        }

        let current = current
            .ok_or_else(|| FederationError::KeyLoad("no current signing key is stored".into()))?;
        Ok(Self { current, all, retired_at })
    }
}

/// Key manager backed by the `signing_keys` table.
pub struct DbKeyManager {
    pool: SqlitePool,
    ring: RwLock<KeyRing>,
    // Serializes rotate/prune so version allocation never races.
    admin: Mutex<()>,
}

impl DbKeyManager {
    /// Load the stored keys, provisioning the first one if the table is empty.
    ///
    /// `configured_seed` is imported instead of generating a key, but only on
    /// an empty table; afterwards the stored keys are authoritative.
    pub async fn load_or_generate(
        pool: SqlitePool,
        configured_seed: Option<&str>,
    ) -> Result<Self, FederationError> {
        let mut rows = signing_keys::load_keys(&pool).await?;

        if rows.is_empty() {
            let kp = match configured_seed {
                Some(seed) => {
                    let kp = ServerKeyPair::from_config(seed)?;
                    info!("Importing configured signing key {}", kp.key_id);
                    kp
                }
                None => {
                    warn!("No signing key stored, generating a new Ed25519 key pair");
                    ServerKeyPair::generate(0)
                }
            };
            signing_keys::insert_current(&pool, &stored(&kp)).await?;
            info!("Persisted signing key {}", kp.key_id);
            rows = signing_keys::load_keys(&pool).await?;
        } else if let Some(seed) = configured_seed {
            let configured = ServerKeyPair::from_config(seed)?;
            if !rows.iter().any(|r| r.seed_bytes == configured.seed_bytes()) {
                warn!(
                    "Configured signing key {} is not in the key store; using stored keys",
                    configured.key_id
                );
            }
        }

        let ring = KeyRing::from_rows(&rows)?;
        info!("Loaded {} signing key(s); current is {}", ring.all.len(), ring.current.key_id);
        Ok(Self { pool, ring: RwLock::new(ring), admin: Mutex::new(()) })
    }

    /// Generate and persist a new current key. Returns its key ID.
    pub async fn rotate(&self) -> Result<String, FederationError> {
        let _admin = self.admin.lock().await;
        let next_version = signing_keys::load_keys(&self.pool)
            .await?
            .iter()
            .map(|r| r.version)
            .max()
            .map_or(0, |v| v + 1);

        let kp = ServerKeyPair::generate(next_version);
        signing_keys::insert_current(&self.pool, &stored(&kp)).await?;

        let now = Utc::now().timestamp_millis();
        let kp = Arc::new(kp);
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let retiring = ring.current.key_id.clone();
        ring.retired_at.insert(retiring, now);
        ring.all.insert(kp.key_id.clone(), kp.clone());
        ring.current = kp;

        info!("Rotated signing key; current is {}", ring.current.key_id);
        Ok(ring.current.key_id.clone())
    }

    /// Forget a retired key. Returns `false` if it was not known.
    pub async fn prune(&self, key_id: &str) -> Result<bool, FederationError> {
        let _admin = self.admin.lock().await;
        let version = {
            let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
            if ring.current.key_id == key_id {
                return Err(FederationError::CurrentKeyInUse(key_id.to_owned()));
            }
            match ring.all.get(key_id) {
                Some(kp) => kp.version,
                None => return Ok(false),
            }
        };

        let removed = signing_keys::delete_retired(&self.pool, version).await?;
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.all.remove(key_id);
        ring.retired_at.remove(key_id);
        info!("Pruned signing key {}", key_id);
        Ok(removed)
    }

    /// The self-signed key document published for `server_name`.
    pub fn key_document(&self, server_name: &str) -> Result<ServerKeys, FederationError> {
        let (verify_keys, old_verify_keys) = {
            let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
            let verify_keys = BTreeMap::from([(
                ring.current.key_id.clone(),
                VerifyKey { key: ring.current.public_key_base64() },
            )]);
            let old_verify_keys = ring
                .all
                .iter()
                .filter(|(id, _)| **id != ring.current.key_id)
                .map(|(id, kp)| {
                    let expired_ts = ring.retired_at.get(id).copied().unwrap_or_default();
                    (id.clone(), OldVerifyKey { key: kp.public_key_base64(), expired_ts })
                })
                .collect();
            (verify_keys, old_verify_keys)
        };

        let doc = ServerKeys {
            server_name: server_name.to_owned(),
            verify_keys,
            old_verify_keys,
            valid_until_ts: (Utc::now() + Duration::hours(KEY_DOCUMENT_TTL_HOURS))
                .timestamp_millis(),
            signatures: BTreeMap::new(),
        };

        let mut value = serde_json::to_value(&doc)?;
        signatures::sign_json(self, server_name, &mut value)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl KeyManager for DbKeyManager {
    fn sign(&self, payload: &[u8]) -> Result<KeySignature, FederationError> {
        let current = self.ring.read().unwrap_or_else(PoisonError::into_inner).current.clone();
        Ok(KeySignature { key_id: current.key_id.clone(), signature: current.sign_bytes(payload) })
    }

    fn verify(&self, payload: &[u8], signature: &str, key_id: &str) -> bool {
        let kp = self.ring.read().unwrap_or_else(PoisonError::into_inner).all.get(key_id).cloned();
        kp.is_some_and(|kp| {
            keys::verify_signature(&kp.public_key_base64(), signature, payload).is_ok()
        })
    }

    fn current_public_key(&self) -> (String, String) {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        (ring.current.key_id.clone(), ring.current.public_key_base64())
    }
}

fn stored(kp: &ServerKeyPair) -> StoredSigningKey {
    StoredSigningKey {
        version: kp.version,
        algorithm: ALGORITHM.to_owned(),
        seed_bytes: kp.seed_bytes().to_vec(),
        public_key: kp.public_key_base64(),
        created_at: Utc::now().timestamp_millis(),
        is_current: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_db::Database;

    async fn manager(seed: Option<&str>) -> (Database, DbKeyManager) {
        let db = Database::connect_in_memory().await.unwrap();
        let km = DbKeyManager::load_or_generate(db.pool.clone(), seed).await.unwrap();
        (db, km)
    }

    #[tokio::test]
    async fn first_key_is_persisted_before_use() {
        let (db, km) = manager(None).await;
        let (key_id, public) = km.current_public_key();
        assert_eq!(key_id, "ed25519:0");

        let rows = signing_keys::load_keys(&db.pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].public_key, public);

        // A second manager over the same store signs with the same key.
        let again = DbKeyManager::load_or_generate(db.pool.clone(), None).await.unwrap();
        assert_eq!(again.current_public_key(), (key_id, public));
    }

    #[tokio::test]
    async fn configured_seed_is_imported() {
        let kp = ServerKeyPair::generate(0);
        let seed = format!("ed25519 5 {}", keys::encode_base64(&kp.seed_bytes()));
        let (_db, km) = manager(Some(&seed)).await;
        assert_eq!(km.current_public_key(), ("ed25519:5".into(), kp.public_key_base64()));
    }

    #[tokio::test]
    async fn rotated_keys_still_verify_until_pruned() {
        let (_db, km) = manager(None).await;
        let old = km.sign(b"payload").unwrap();

        let new_id = km.rotate().await.unwrap();
        assert_eq!(new_id, "ed25519:1");
        let new = km.sign(b"payload").unwrap();
        assert_eq!(new.key_id, new_id);

        assert!(km.verify(b"payload", &old.signature, &old.key_id));
        assert!(km.verify(b"payload", &new.signature, &new.key_id));
        assert!(!km.verify(b"other", &new.signature, &new.key_id));

        assert!(km.prune(&old.key_id).await.unwrap());
        assert!(!km.verify(b"payload", &old.signature, &old.key_id));
    }

    #[tokio::test]
    async fn pruning_current_key_is_refused() {
        let (_db, km) = manager(None).await;
        let (current, _) = km.current_public_key();
        assert!(matches!(km.prune(&current).await, Err(FederationError::CurrentKeyInUse(_))));
        assert!(!km.prune("ed25519:99").await.unwrap());
    }

    #[tokio::test]
    async fn key_document_is_self_signed() {
        let (_db, km) = manager(None).await;
        km.rotate().await.unwrap();
        let doc = km.key_document("id.example.org").unwrap();

        assert_eq!(doc.verify_keys.keys().collect::<Vec<_>>(), vec!["ed25519:1"]);
        assert!(doc.old_verify_keys.contains_key("ed25519:0"));
        assert!(doc.valid_until_ts > Utc::now().timestamp_millis());

        let value = serde_json::to_value(&doc).unwrap();
        signatures::verify_signed_json(&value, "id.example.org", |id| {
            doc.verify_keys.get(id).map(|k| k.key.clone())
        })
        .unwrap();
    }
}
