//! Server-to-server HTTP client.
//!
//! The [`FederationClient`] handles all outbound communication: fetching
//! remote signing keys (directly or through a notary), notifying homeservers
//! of bindings with pending invites, and pushing replication batches to peers.
//! Every request except key fetches is signed with this server's current key.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::{Value, json};
use sigil_common::{
    config::{AppConfig, KeyResolution, PeerConfig},
    validation::server_name_of,
};
use tracing::debug;

use crate::{
    discovery::DiscoveryCache,
    error::FederationError,
    key_manager::KeyManager,
    signatures::{sign_json, sign_request, verify_signed_json},
    transport::{KeyFetcher, NotificationTransport, PeerTransport},
    types::{
        NotaryKeysResponse, OnBind, OnBindBody, OnBindInvite, ReplicationAck, ReplicationBatch,
        ServerKeys,
    },
};

const ON_BIND_PATH: &str = "/_matrix/federation/v1/3pid/onbind";
const REPLICATION_PUSH_PATH: &str = "/_matrix/identity/replicate/v1/push";
const SERVER_KEYS_PATH: &str = "/_matrix/key/v2/server";

// ─── Client ──────────────────────────────────────────────────────────────────

/// Async HTTP client for outbound server-to-server requests.
pub struct FederationClient {
    server_name: String,
    keys: Arc<dyn KeyManager>,
    http: Client,
    discovery: DiscoveryCache,
    key_resolution: KeyResolution,
    notary_server: Option<String>,
}

impl FederationClient {
    pub fn new(config: &AppConfig, keys: Arc<dyn KeyManager>) -> Result<Self, FederationError> {
        let timeout = Duration::from_secs(config.federation.request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Sigil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Other(anyhow::anyhow!("building http client: {e}")))?;

        Ok(Self {
            server_name: config.server.name.clone(),
            keys,
            http,
            discovery: DiscoveryCache::new(timeout)?,
            key_resolution: config.federation.key_resolution,
            notary_server: config.federation.notary_server.clone(),
        })
    }

    // ── Server keys ──────────────────────────────────────────────────────────

    /// `GET /_matrix/key/v2/server` on the server itself.
    async fn fetch_direct(&self, server_name: &str) -> Result<ServerKeys, FederationError> {
        let base_url = self.discovery.resolve(server_name).await?;
        // Key fetch is unauthenticated.
        let url = format!("{}{}", base_url, SERVER_KEYS_PATH);
        debug!("Fetching server keys from {}", url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FederationError::RemoteHttp(server_name.to_owned(), e.to_string()))?;
        let raw: Value = parse_json(server_name, resp).await?;
        check_key_document(server_name, &raw)
    }

    /// `GET /_matrix/key/v2/query/<server>` on the notary. The returned
    /// document must be signed by both its owner and the notary.
    async fn fetch_via_notary(
        &self,
        notary: &str,
        server_name: &str,
    ) -> Result<ServerKeys, FederationError> {
        let notary_keys = self.fetch_direct(notary).await?;
        let base_url = self.discovery.resolve(notary).await?;
        let url = format!("{}/_matrix/key/v2/query/{}", base_url, urlencoded(server_name));
        debug!("Fetching keys of {} via notary {}", server_name, url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FederationError::RemoteHttp(notary.to_owned(), e.to_string()))?;
        let response: NotaryKeysResponse = parse_json(notary, resp).await?;

        // Signatures cover the documents as sent, so they are checked before
        // anything is dropped by deserialization.
        let mut newest: Option<ServerKeys> = None;
        for raw in response.server_keys {
            if raw.get("server_name").and_then(Value::as_str) != Some(server_name) {
                continue;
            }
            let doc = check_key_document(server_name, &raw)?;
            verify_signed_json(&raw, notary, |id| {
                notary_keys.verify_keys.get(id).map(|k| k.key.clone())
            })?;
            if newest.as_ref().is_none_or(|n| n.valid_until_ts < doc.valid_until_ts) {
                newest = Some(doc);
            }
        }
        newest.ok_or_else(|| {
            FederationError::RemoteProtocol(notary.to_owned(), format!("no keys for {server_name}"))
        })
    }

    // ── Signed request helpers ───────────────────────────────────────────────

    async fn signed_post<B: Serialize>(
        &self,
        destination: &str,
        base_url: &str,
        uri: &str,
        body: &B,
    ) -> Result<Response, FederationError> {
        let content = serde_json::to_value(body)?;
        let auth = sign_request(
            self.keys.as_ref(),
            &self.server_name,
            destination,
            "POST",
            uri,
            Some(&content),
        )?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), uri);
        debug!("Federation POST {}", url);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", auth.to_header())
            .json(&content)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FederationError::RemoteHttp(destination.to_owned(), e.to_string()))?;
        Ok(resp)
    }
}

#[async_trait]
impl KeyFetcher for FederationClient {
    async fn fetch_server_keys(&self, server_name: &str) -> Result<ServerKeys, FederationError> {
        match (self.key_resolution, self.notary_server.as_deref()) {
            (KeyResolution::Notary, Some(notary)) if notary != server_name => {
                self.fetch_via_notary(notary, server_name).await
            }
            _ => self.fetch_direct(server_name).await,
        }
    }
}

#[async_trait]
impl NotificationTransport for FederationClient {
    /// `POST /_matrix/federation/v1/3pid/onbind` on the bound account's homeserver.
    async fn deliver_on_bind(&self, n: &OnBind) -> Result<(), FederationError> {
        let destination = server_name_of(&n.account_id)
            .map_err(|e| FederationError::DiscoveryFailed(n.account_id.clone(), e.to_string()))?;

        let mut signed = json!({ "mxid": n.account_id, "token": n.token });
        sign_json(self.keys.as_ref(), &self.server_name, &mut signed)?;

        let body = OnBindBody {
            medium: n.medium,
            address: &n.address,
            mxid: &n.account_id,
            invites: vec![OnBindInvite {
                medium: n.medium,
                address: &n.address,
                mxid: &n.account_id,
                room_id: &n.room_id,
                sender: &n.sender,
                token: &n.token,
                signed,
            }],
        };

        let base_url = self.discovery.resolve(destination).await?;
        if let Err(e) = self.signed_post(destination, &base_url, ON_BIND_PATH, &body).await {
            self.discovery.invalidate(destination).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for FederationClient {
    /// `POST /_matrix/identity/replicate/v1/push` on the peer's configured endpoint.
    async fn push_batch(
        &self,
        peer: &PeerConfig,
        batch: &ReplicationBatch,
    ) -> Result<ReplicationAck, FederationError> {
        let resp = self.signed_post(&peer.name, &peer.endpoint, REPLICATION_PUSH_PATH, batch).await?;
        parse_json(&peer.name, resp).await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn parse_json<T: serde::de::DeserializeOwned>(
    server: &str,
    resp: Response,
) -> Result<T, FederationError> {
    resp.json()
        .await
        .map_err(|e| FederationError::RemoteProtocol(server.to_owned(), e.to_string()))
}

/// A key document must name the server it was fetched for and be signed by
/// one of its own keys.
fn check_key_document(server_name: &str, raw: &Value) -> Result<ServerKeys, FederationError> {
    let doc: ServerKeys = serde_json::from_value(raw.clone())
        .map_err(|e| FederationError::RemoteProtocol(server_name.to_owned(), e.to_string()))?;
    if doc.server_name != server_name {
        return Err(FederationError::RemoteProtocol(
            server_name.to_owned(),
            format!("key document is for '{}'", doc.server_name),
        ));
    }
    verify_signed_json(raw, server_name, |id| doc.verify_keys.get(id).map(|k| k.key.clone()))?;
    Ok(doc)
}

fn urlencoded(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
