//! Bind and unbind orchestration.
//!
//! Per identifier: `Unbound → Bound → Unbound`, or `Bound → Bound` on a
//! rebind. Gating work (signature checks, the store write) happens inline and
//! its failures propagate; advisory work (invite delivery, replication) is
//! handed off and can never change the result.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sigil_common::{
    Association, Medium, NewAssociation, NewTombstone, SigilError, SigilResult,
    config::AppConfig,
    redact::RedactionPolicy,
    validation::{canonicalize_address, validate_account_id},
};
use sigil_db::AssociationStore;
use sigil_federation::{
    ClaimedSignature, FederationVerifier, KeyManager,
    signatures::{canonical_json, request_signing_object, sign_json},
};
use tracing::{info, warn};

use crate::{
    invites::{InviteDelivery, RetryReport},
    signal::ReplicationSignal,
};

pub const UNBIND_PATH: &str = "/_matrix/identity/api/v1/3pid/unbind";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    Removed,
    /// Nothing bound to the caller was active for the identifier.
    NotFound,
}

#[derive(Debug, Clone)]
pub struct BinderSettings {
    /// Our server name; signatures are made under it.
    pub server_name: String,
    /// Validity of a new binding, unbounded when `None`.
    pub lifetime_ms: Option<i64>,
    pub redaction: RedactionPolicy,
}

impl BinderSettings {
    pub fn from_config(config: &AppConfig) -> SigilResult<Self> {
        Ok(Self {
            server_name: config.server.name.clone(),
            lifetime_ms: config
                .associations
                .lifetime_ms()
                .map_err(|e| SigilError::Internal(anyhow::anyhow!(e)))?,
            redaction: config.redaction.policy(),
        })
    }
}

pub struct ThreepidBinder {
    settings: BinderSettings,
    keys: Arc<dyn KeyManager>,
    associations: Arc<dyn AssociationStore>,
    verifier: Arc<dyn FederationVerifier>,
    invites: InviteDelivery,
    replication: ReplicationSignal,
}

impl ThreepidBinder {
    pub fn new(
        settings: BinderSettings,
        keys: Arc<dyn KeyManager>,
        associations: Arc<dyn AssociationStore>,
        verifier: Arc<dyn FederationVerifier>,
        invites: InviteDelivery,
        replication: ReplicationSignal,
    ) -> Self {
        Self { settings, keys, associations, verifier, invites, replication }
    }

    /// Bind a validated identifier to `account_id`, superseding any previous
    /// binding, and return the persisted signed association.
    pub async fn bind(
        &self,
        medium: Medium,
        address: &str,
        account_id: &str,
        validated: bool,
    ) -> SigilResult<Association> {
        if !validated {
            return Err(SigilError::ValidationPrecondition {
                message: "identifier ownership has not been validated".into(),
            });
        }
        validate_account_id(account_id)?;
        let address = canonicalize_address(medium, address)?;

        let now = Utc::now().timestamp_millis();
        let mut association = NewAssociation {
            medium,
            address,
            account_id: account_id.to_owned(),
            not_before: now,
            not_after: self.settings.lifetime_ms.map(|l| now.saturating_add(l)),
            created_at: now,
            signed_payload: String::new(),
        };
        association.signed_payload = self.sign(&association.attestation())?;

        let sequence_no = self.associations.upsert(&association).await?;
        info!(
            %medium,
            address = %self.redacted(medium, &association.address),
            sequence_no,
            "Bound identifier"
        );

        self.invites.spawn(medium, association.address.clone()).await;
        self.replication.notify();

        Ok(association.with_sequence_no(sequence_no))
    }

    /// Remove the identifier's binding to `account_id`, provided `claimed` is
    /// that account's homeserver signing the unbind request.
    ///
    /// The signature covers the address exactly as the caller sent it.
    pub async fn unbind(
        &self,
        medium: Medium,
        address: &str,
        account_id: &str,
        claimed: &ClaimedSignature,
    ) -> SigilResult<UnbindOutcome> {
        validate_account_id(account_id)?;
        let canonical = canonicalize_address(medium, address)?;

        let payload = unbind_request_payload(
            &claimed.origin,
            &self.settings.server_name,
            account_id,
            medium,
            address,
        )?;
        if !self.verifier.verify_identity_ownership(account_id, claimed, payload.as_bytes()).await {
            warn!(
                %medium,
                address = %self.redacted(medium, &canonical),
                origin = %claimed.origin,
                "Rejected unbind without valid proof of ownership"
            );
            return Err(SigilError::AuthorizationFailure { account_id: account_id.to_owned() });
        }

        let mut tombstone = NewTombstone {
            medium,
            address: canonical,
            account_id: account_id.to_owned(),
            deleted_at: Utc::now().timestamp_millis(),
            signed_payload: String::new(),
        };
        tombstone.signed_payload = self.sign(&tombstone.attestation())?;

        let removed = self
            .associations
            .delete(medium, &tombstone.address, account_id, &tombstone)
            .await?;
        if !removed {
            return Ok(UnbindOutcome::NotFound);
        }

        info!(%medium, address = %self.redacted(medium, &tombstone.address), "Unbound identifier");
        self.replication.notify();
        Ok(UnbindOutcome::Removed)
    }

    /// Re-attempt delivery of invites left undelivered by earlier binds.
    pub async fn retry_undelivered_invites(&self) -> SigilResult<RetryReport> {
        self.invites.retry().await
    }

    /// Wait for in-flight background invite deliveries.
    pub async fn drain(&self) {
        self.invites.drain().await;
    }

    fn sign<T: Serialize>(&self, attestation: &T) -> SigilResult<String> {
        let mut value =
            serde_json::to_value(attestation).map_err(|e| SigilError::Signing(e.to_string()))?;
        sign_json(self.keys.as_ref(), &self.settings.server_name, &mut value)?;
        Ok(canonical_json(&value)?)
    }

    fn redacted(&self, medium: Medium, address: &str) -> String {
        self.settings.redaction.redact(medium, address)
    }
}

/// The canonical request object a homeserver signs to unbind `address`.
pub fn unbind_request_payload(
    origin: &str,
    destination: &str,
    account_id: &str,
    medium: Medium,
    address: &str,
) -> SigilResult<String> {
    let content = json!({
        "mxid": account_id,
        "threepid": { "medium": medium, "address": address },
    });
    Ok(request_signing_object(origin, destination, "POST", UNBIND_PATH, Some(&content))?)
}
