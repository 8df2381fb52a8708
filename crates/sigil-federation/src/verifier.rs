//! Proof that a request really comes from the homeserver owning an account.
//!
//! Remote signing keys are cached until the `valid_until_ts` their server
//! published. A miss or an expired entry triggers a fresh fetch, as does a key
//! ID the cached document does not list once a minimum interval has passed.
//! A fetched document that is already expired is refused. Any resolution
//! failure counts as "not proven".

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use sigil_common::validation::server_name_of;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{keys::verify_signature, signatures::ClaimedSignature, transport::KeyFetcher};

#[async_trait]
pub trait FederationVerifier: Send + Sync {
    /// Whether `claimed` is a valid signature over `payload` by the server
    /// that owns `account_id`.
    async fn verify_identity_ownership(
        &self,
        account_id: &str,
        claimed: &ClaimedSignature,
        payload: &[u8],
    ) -> bool;
}

// A still-valid document lacking the requested key is not refetched sooner than this.
const MIN_REFETCH_MS: i64 = 60_000;

#[derive(Debug, Clone)]
struct CachedKeys {
    verify_keys: HashMap<String, String>,
    valid_until_ts: i64,
    fetched_at: i64,
}

/// [`FederationVerifier`] resolving keys through a [`KeyFetcher`].
pub struct RemoteKeyVerifier {
    fetcher: Arc<dyn KeyFetcher>,
    cache: RwLock<HashMap<String, CachedKeys>>,
    min_refetch_ms: i64,
}

impl RemoteKeyVerifier {
    pub fn new(fetcher: Arc<dyn KeyFetcher>) -> Self {
        Self { fetcher, cache: RwLock::new(HashMap::new()), min_refetch_ms: MIN_REFETCH_MS }
    }

    async fn public_key(&self, server_name: &str, key_id: &str) -> Option<String> {
        let now = Utc::now().timestamp_millis();
        if let Some(entry) = self.cache.read().await.get(server_name) {
            if entry.valid_until_ts > now {
                if let Some(key) = entry.verify_keys.get(key_id) {
                    debug!("Key cache hit: {} {}", server_name, key_id);
                    return Some(key.clone());
                }
                if now - entry.fetched_at < self.min_refetch_ms {
                    debug!("Unknown key {} for {}, refetched too recently", key_id, server_name);
                    return None;
                }
            }
        }

        let fetched = match self.fetcher.fetch_server_keys(server_name).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Could not fetch signing keys of {}: {}", server_name, e);
                return None;
            }
        };
        if fetched.server_name != server_name {
            warn!("Key document for {} names {}", server_name, fetched.server_name);
            return None;
        }
        if fetched.valid_until_ts <= now {
            warn!(
                "Key document for {} expired at {}, refusing its keys",
                server_name, fetched.valid_until_ts
            );
            return None;
        }

        let entry = CachedKeys {
            verify_keys: fetched.verify_keys.into_iter().map(|(id, k)| (id, k.key)).collect(),
            valid_until_ts: fetched.valid_until_ts,
            fetched_at: now,
        };
        let key = entry.verify_keys.get(key_id).cloned();
        self.cache.write().await.insert(server_name.to_owned(), entry);
        key
    }
}

#[async_trait]
impl FederationVerifier for RemoteKeyVerifier {
    async fn verify_identity_ownership(
        &self,
        account_id: &str,
        claimed: &ClaimedSignature,
        payload: &[u8],
    ) -> bool {
        let Ok(server_name) = server_name_of(account_id) else {
            return false;
        };
        if claimed.origin != server_name {
            debug!("Signature origin {} does not own {}", claimed.origin, account_id);
            return false;
        }
        let Some(public_key) = self.public_key(server_name, &claimed.key_id).await else {
            return false;
        };
        verify_signature(&public_key, &claimed.sig, payload).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::FederationError,
        keys::ServerKeyPair,
        types::{ServerKeys, VerifyKey},
    };
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    struct FakeFetcher {
        key: ServerKeyPair,
        valid_until_ts: i64,
        fetches: AtomicUsize,
        fail: bool,
    }

    impl FakeFetcher {
        fn new(valid_until_ts: i64) -> Self {
            Self { key: ServerKeyPair::generate(0), valid_until_ts, fetches: AtomicUsize::new(0), fail: false }
        }

        fn sign(&self, payload: &[u8]) -> ClaimedSignature {
            ClaimedSignature {
                origin: "hs.example.org".into(),
                key_id: self.key.key_id.clone(),
                sig: self.key.sign_bytes(payload),
            }
        }
    }

    #[async_trait]
    impl KeyFetcher for FakeFetcher {
        async fn fetch_server_keys(&self, server_name: &str) -> Result<ServerKeys, FederationError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FederationError::RemoteHttp(server_name.into(), "unreachable".into()));
            }
            Ok(ServerKeys {
                server_name: server_name.to_owned(),
                verify_keys: BTreeMap::from([(
                    self.key.key_id.clone(),
                    VerifyKey { key: self.key.public_key_base64() },
                )]),
                old_verify_keys: BTreeMap::new(),
                valid_until_ts: self.valid_until_ts,
                signatures: BTreeMap::new(),
            })
        }
    }

    fn far_future() -> i64 {
        Utc::now().timestamp_millis() + 3_600_000
    }

    #[tokio::test]
    async fn valid_signature_from_owning_server_is_accepted_and_cached() {
        let fetcher = Arc::new(FakeFetcher::new(far_future()));
        let verifier = RemoteKeyVerifier::new(fetcher.clone());
        let claimed = fetcher.sign(b"payload");

        assert!(verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
        assert!(verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_key_documents_are_refused_and_not_cached() {
        let fetcher = Arc::new(FakeFetcher::new(Utc::now().timestamp_millis() - 86_400_000));
        let verifier = RemoteKeyVerifier::new(fetcher.clone());
        let claimed = fetcher.sign(b"payload");

        assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
        assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_entries_past_their_validity_are_refetched() {
        let fetcher = Arc::new(FakeFetcher::new(far_future()));
        let verifier = RemoteKeyVerifier::new(fetcher.clone());
        let claimed = fetcher.sign(b"payload");

        assert!(verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
        if let Some(entry) = verifier.cache.write().await.get_mut("hs.example.org") {
            entry.valid_until_ts = 0;
        }
        assert!(verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_key_ids_do_not_force_a_fetch_per_request() {
        let fetcher = Arc::new(FakeFetcher::new(far_future()));
        let mut verifier = RemoteKeyVerifier::new(fetcher.clone());
        let claimed = fetcher.sign(b"payload");
        assert!(verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);

        let mut unknown_key = claimed.clone();
        for version in 1..=5 {
            unknown_key.key_id = format!("ed25519:{version}");
            assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &unknown_key, b"payload").await);
        }
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

        verifier.min_refetch_ms = 0;
        assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &unknown_key, b"payload").await);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn foreign_origin_or_bad_signature_is_rejected() {
        let fetcher = Arc::new(FakeFetcher::new(far_future()));
        let verifier = RemoteKeyVerifier::new(fetcher.clone());
        let claimed = fetcher.sign(b"payload");

        assert!(!verifier.verify_identity_ownership("@alice:other.org", &claimed, b"payload").await);
        assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"tampered").await);
        assert!(!verifier.verify_identity_ownership("not-an-mxid", &claimed, b"payload").await);

        let mut unknown_key = claimed.clone();
        unknown_key.key_id = "ed25519:9".into();
        assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &unknown_key, b"payload").await);
    }

    #[tokio::test]
    async fn fetch_failure_is_not_proof() {
        let mut fetcher = FakeFetcher::new(far_future());
        fetcher.fail = true;
        let claimed = fetcher.sign(b"payload");
        let verifier = RemoteKeyVerifier::new(Arc::new(fetcher));
        assert!(!verifier.verify_identity_ownership("@alice:hs.example.org", &claimed, b"payload").await);
    }
}
