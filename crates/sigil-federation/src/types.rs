//! Federation wire types: key documents, onBind notifications, and
//! replication batches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sigil_common::{Change, Medium};

use crate::error::FederationError;

// ─── Server keys ─────────────────────────────────────────────────────────────

/// A single public verify key entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyKey {
    /// Unpadded base64 Ed25519 public key bytes.
    pub key: String,
}

/// A retired key, still listed so old signatures can be checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldVerifyKey {
    pub key: String,
    pub expired_ts: i64,
}

/// The self-signed key document served at `/_matrix/key/v2/server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerKeys {
    pub server_name: String,
    pub verify_keys: BTreeMap<String, VerifyKey>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    /// Unix millisecond timestamp after which this document should be re-fetched.
    pub valid_until_ts: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

/// Response shape of a notary's `/_matrix/key/v2/query/<server>`. Documents
/// stay raw so their signatures can be checked over the bytes as sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotaryKeysResponse {
    pub server_keys: Vec<Value>,
}

/// Response shape for `/.well-known/matrix/server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownServer {
    /// The delegated server name (may differ from the queried hostname).
    #[serde(rename = "m.server")]
    pub server: String,
}

// ─── onBind ──────────────────────────────────────────────────────────────────

/// A pending invite whose identifier has just been bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnBind {
    pub medium: Medium,
    pub address: String,
    /// The account the identifier is now bound to.
    pub account_id: String,
    pub room_id: String,
    pub sender: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct OnBindInvite<'a> {
    pub medium: Medium,
    pub address: &'a str,
    pub mxid: &'a str,
    pub room_id: &'a str,
    pub sender: &'a str,
    pub token: &'a str,
    /// `{mxid, token, signatures}` signed by this server.
    pub signed: Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct OnBindBody<'a> {
    pub medium: Medium,
    pub address: &'a str,
    pub mxid: &'a str,
    pub invites: Vec<OnBindInvite<'a>>,
}

// ─── Replication ─────────────────────────────────────────────────────────────

/// One log entry as shipped to a peer. The signed payload is the source of
/// truth; receivers re-derive every field from it after verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedRecord {
    pub sequence_no: i64,
    #[serde(default)]
    pub tombstone: bool,
    pub signed: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub origin: String,
    pub records: Vec<ReplicatedRecord>,
}

impl ReplicationBatch {
    /// Wrap already-signed log entries for shipment, preserving their order.
    pub fn from_changes(origin: &str, changes: &[Change]) -> Result<Self, FederationError> {
        let records = changes
            .iter()
            .map(|change| {
                Ok(ReplicatedRecord {
                    sequence_no: change.sequence_no(),
                    tombstone: change.is_tombstone(),
                    signed: serde_json::from_str(change.signed_payload())?,
                })
            })
            .collect::<Result<Vec<_>, FederationError>>()?;
        Ok(Self { origin: origin.to_owned(), records })
    }

    pub fn last_sequence_no(&self) -> Option<i64> {
        self.records.last().map(|r| r.sequence_no)
    }
}

/// Peer acknowledgment of a pushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAck {
    pub last_sequence_applied: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::{Association, Tombstone};

    #[test]
    fn batch_keeps_log_order_and_kinds() {
        let changes = vec![
            Change::Bound(Association {
                medium: Medium::Email,
                address: "a@example.com".into(),
                account_id: "@a:example.org".into(),
                not_before: 0,
                not_after: None,
                created_at: 0,
                sequence_no: 4,
                signed_payload: r#"{"mxid":"@a:example.org"}"#.into(),
            }),
            Change::Tombstone(Tombstone {
                medium: Medium::Email,
                address: "a@example.com".into(),
                account_id: "@a:example.org".into(),
                deleted_at: 1,
                sequence_no: 9,
                signed_payload: r#"{"deleted_ts":1}"#.into(),
            }),
        ];
        let batch = ReplicationBatch::from_changes("id.example.org", &changes).unwrap();
        assert_eq!(batch.last_sequence_no(), Some(9));
        assert!(!batch.records[0].tombstone);
        assert!(batch.records[1].tombstone);
        assert_eq!(batch.records[1].signed["deleted_ts"], 1);
    }

    #[test]
    fn key_document_omits_empty_sections() {
        let doc = ServerKeys {
            server_name: "id.example.org".into(),
            verify_keys: BTreeMap::from([("ed25519:0".into(), VerifyKey { key: "abc".into() })]),
            old_verify_keys: BTreeMap::new(),
            valid_until_ts: 1,
            signatures: BTreeMap::new(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("old_verify_keys").is_none());
        assert!(json.get("signatures").is_none());
    }
}
