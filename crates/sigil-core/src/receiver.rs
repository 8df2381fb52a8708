//! Applying replication batches pushed to us by peers.
//!
//! The HTTP layer authenticates the sending server; this module trusts only
//! that name. Every record must carry a valid signature from that peer's
//! configured key, and all of its stored fields come from the signed body.
//! A batch with any bad record is rejected whole, before anything is written.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use sigil_common::{
    BindingAttestation, SigilError, SigilResult, UnbindingAttestation, config::PeerConfig,
    validation::{canonicalize_address, validate_account_id},
};
use sigil_db::{ReplicatedAssociation, ReplicatedAssociationStore};
use sigil_federation::{
    ReplicatedRecord, ReplicationAck, ReplicationBatch,
    signatures::{canonical_json, verify_signed_json},
};
use tracing::{debug, info, warn};

pub struct ReplicationReceiver {
    peers: HashMap<String, PeerConfig>,
    store: ReplicatedAssociationStore,
}

impl ReplicationReceiver {
    pub fn new(peers: &[PeerConfig], store: ReplicatedAssociationStore) -> Self {
        let peers = peers.iter().map(|p| (p.name.clone(), p.clone())).collect();
        Self { peers, store }
    }

    /// Verify and apply a batch from `origin`. Re-applying a batch, or
    /// applying batches out of order, converges to the same state.
    pub async fn apply_batch(
        &self,
        origin: &str,
        batch: &ReplicationBatch,
    ) -> SigilResult<ReplicationAck> {
        let peer = self.peers.get(origin).ok_or_else(|| {
            warn!(origin, "Replication push from unknown peer");
            SigilError::AuthorizationFailure { account_id: origin.to_owned() }
        })?;
        if batch.origin != origin {
            return Err(SigilError::AuthorizationFailure { account_id: batch.origin.clone() });
        }

        let records = batch
            .records
            .iter()
            .map(|record| verified(peer, record))
            .collect::<SigilResult<Vec<_>>>()?;

        let mut applied = 0usize;
        for record in &records {
            if self.store.apply(record).await? {
                applied += 1;
            }
        }

        let last_sequence_applied = batch.records.iter().map(|r| r.sequence_no).max().unwrap_or(0);
        if applied > 0 {
            info!(origin, records = records.len(), applied, through = last_sequence_applied, "Applied replication batch");
        } else {
            debug!(origin, records = records.len(), "Replication batch contained nothing new");
        }
        Ok(ReplicationAck { last_sequence_applied })
    }
}

fn verified(peer: &PeerConfig, record: &ReplicatedRecord) -> SigilResult<ReplicatedAssociation> {
    verify_signed_json(&record.signed, &peer.name, |_| Some(peer.verify_key.clone())).map_err(|e| {
        warn!(origin = %peer.name, sequence_no = record.sequence_no, "Rejecting replicated record: {}", e);
        SigilError::AuthorizationFailure { account_id: peer.name.clone() }
    })?;

    let signed_payload = canonical_json(&record.signed)?;
    let replicated = if record.tombstone {
        let body: UnbindingAttestation = signed_body(&record.signed)?;
        ReplicatedAssociation {
            origin_server: peer.name.clone(),
            origin_sequence_no: record.sequence_no,
            medium: body.medium,
            address: body.address,
            account_id: body.account_id,
            not_before: body.deleted_ts,
            not_after: None,
            created_at: body.deleted_ts,
            signed_payload,
            tombstone: true,
        }
    } else {
        let body: BindingAttestation = signed_body(&record.signed)?;
        ReplicatedAssociation {
            origin_server: peer.name.clone(),
            origin_sequence_no: record.sequence_no,
            medium: body.medium,
            address: body.address,
            account_id: body.account_id,
            not_before: body.not_before,
            not_after: body.not_after,
            created_at: body.ts,
            signed_payload,
            tombstone: false,
        }
    };

    if canonicalize_address(replicated.medium, &replicated.address)? != replicated.address {
        return Err(SigilError::invalid_identifier("replicated address is not canonical"));
    }
    validate_account_id(&replicated.account_id)?;
    Ok(replicated)
}

fn signed_body<T: DeserializeOwned>(signed: &Value) -> SigilResult<T> {
    serde_json::from_value(signed.clone()).map_err(|e| SigilError::ValidationPrecondition {
        message: format!("malformed replicated record: {e}"),
    })
}
