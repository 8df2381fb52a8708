//! Server discovery. Resolves a bare server name to a reachable HTTPS base URL.
//!
//! Resolution order (Matrix server discovery, without SRV):
//!
//! 1. **IP literal / explicit port**: `server:8448` → use as-is
//! 2. **`.well-known/matrix/server`**: GET `https://<name>/.well-known/matrix/server`
//!    If found, follow the delegated server name.
//! 3. **Direct HTTPS fallback**: `https://<name>:8448`
//!
//! Results are cached in memory with a 24-hour TTL.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{error::FederationError, types::WellKnownServer};

/// Default federation port.
const DEFAULT_FED_PORT: u16 = 8448;

/// How long to cache a resolved base URL before re-resolving.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CacheEntry {
    base_url: String,
    resolved_at: Instant,
}

/// In-memory cache for resolved server base URLs.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    inner: Arc<RwLock<HashMap<String, CacheEntry>>>,
    http: reqwest::Client,
}

impl DiscoveryCache {
    pub fn new(timeout: Duration) -> Result<Self, FederationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Sigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Other(anyhow::anyhow!("building discovery client: {e}")))?;
        Ok(Self { inner: Arc::new(RwLock::new(HashMap::new())), http })
    }

    /// Resolve `server_name` to an HTTPS base URL, using cache if valid.
    pub async fn resolve(&self, server_name: &str) -> Result<String, FederationError> {
        if server_name.is_empty() || server_name.contains('/') {
            return Err(FederationError::DiscoveryFailed(
                server_name.to_owned(),
                "not a valid server name".into(),
            ));
        }

        {
            let cache = self.inner.read().await;
            if let Some(entry) = cache.get(server_name) {
                if entry.resolved_at.elapsed() < CACHE_TTL {
                    debug!("Discovery cache hit: {} → {}", server_name, entry.base_url);
                    return Ok(entry.base_url.clone());
                }
            }
        }

        let base_url = self.do_resolve(server_name).await;

        self.inner.write().await.insert(
            server_name.to_owned(),
            CacheEntry { base_url: base_url.clone(), resolved_at: Instant::now() },
        );

        Ok(base_url)
    }

    /// Invalidate cache for a server (e.g. after a connection failure).
    pub async fn invalidate(&self, server_name: &str) {
        self.inner.write().await.remove(server_name);
    }

    // ── Resolution logic ─────────────────────────────────────────────────────

    async fn do_resolve(&self, server_name: &str) -> String {
        if has_explicit_port(server_name) {
            let base = format!("https://{}", server_name);
            debug!("Discovery (explicit port): {} → {}", server_name, base);
            return base;
        }

        if let Some(base) = self.try_well_known(server_name).await {
            debug!("Discovery (well-known): {} → {}", server_name, base);
            return base;
        }

        let base = with_default_port(server_name);
        debug!("Discovery (fallback): {} → {}", server_name, base);
        base
    }

    async fn try_well_known(&self, server_name: &str) -> Option<String> {
        let url = format!("https://{}/.well-known/matrix/server", server_name);
        let resp = self.http.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let wk: WellKnownServer = resp.json().await.ok()?;
        delegated_base_url(&wk)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn delegated_base_url(wk: &WellKnownServer) -> Option<String> {
    let server = wk.server.trim();
    if server.is_empty() || server.contains('/') {
        return None;
    }
    if has_explicit_port(server) {
        Some(format!("https://{}", server))
    } else {
        Some(with_default_port(server))
    }
}

fn with_default_port(server_name: &str) -> String {
    format!("https://{}:{}", server_name, DEFAULT_FED_PORT)
}

fn has_explicit_port(server_name: &str) -> bool {
    // IPv6 literal with port: [::1]:8448
    if server_name.starts_with('[') {
        return server_name.contains("]:");
    }
    // hostname:port, but ignore IPv6 with extra colons.
    let colon_count = server_name.chars().filter(|&c| c == ':').count();
    colon_count == 1
}
