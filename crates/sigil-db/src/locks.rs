//! Per-identifier mutual exclusion.
//!
//! Mutations on the same `(medium, address)` are serialized; different
//! identifiers never contend. Entries are held weakly so idle identifiers do
//! not accumulate.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use sigil_common::Medium;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (Medium, String);

// Dead entries are swept once the map grows past this many keys.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<Key, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `(medium, address)`.
    pub async fn lock(&self, medium: Medium, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if map.len() > SWEEP_THRESHOLD {
                map.retain(|_, weak| weak.strong_count() > 0);
            }
            let key = (medium, address.to_owned());
            match map.get(&key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(AsyncMutex::new(()));
                    map.insert(key, Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock(Medium::Email, "a@example.com").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(Medium::Email, "a@example.com").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(Medium::Email, "a@example.com").await;
        let _b = locks.lock(Medium::Msisdn, "+15551234567").await;
    }
}
