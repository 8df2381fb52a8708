//! Outbound transport contracts.
//!
//! [`crate::client::FederationClient`] implements all three over HTTPS; tests
//! substitute in-memory fakes.

use async_trait::async_trait;
use sigil_common::config::PeerConfig;

use crate::{
    error::FederationError,
    types::{OnBind, ReplicationAck, ReplicationBatch, ServerKeys},
};

/// Tells a homeserver that an identifier with pending invites is now bound.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver_on_bind(&self, notification: &OnBind) -> Result<(), FederationError>;
}

/// Ships replication batches to a peer identity server.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn push_batch(
        &self,
        peer: &PeerConfig,
        batch: &ReplicationBatch,
    ) -> Result<ReplicationAck, FederationError>;
}

/// Retrieves a remote server's published signing keys.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch_server_keys(&self, server_name: &str) -> Result<ServerKeys, FederationError>;
}
