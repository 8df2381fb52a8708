//! Identifier → account associations and their deletion markers.

use serde::{Deserialize, Serialize};

/// The kind of third-party identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Email,
    Msisdn,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Msisdn => "msisdn",
        }
    }
}

impl std::fmt::Display for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Medium {
    type Err = crate::SigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "msisdn" => Ok(Self::Msisdn),
            other => Err(crate::SigilError::invalid_identifier(format!(
                "unsupported medium '{other}'"
            ))),
        }
    }
}

/// The body that gets signed for a binding.
///
/// Serialized as canonical JSON and extended with a `signatures` block; the
/// result is the association's `signed_payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingAttestation {
    pub medium: Medium,
    pub address: String,
    #[serde(rename = "mxid")]
    pub account_id: String,
    pub not_before: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_after: Option<i64>,
    pub ts: i64,
}

/// The body that gets signed for a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindingAttestation {
    pub medium: Medium,
    pub address: String,
    #[serde(rename = "mxid")]
    pub account_id: String,
    pub deleted_ts: i64,
}

/// A signed association that has not been assigned a sequence number yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssociation {
    pub medium: Medium,
    pub address: String,
    pub account_id: String,
    pub not_before: i64,
    pub not_after: Option<i64>,
    pub created_at: i64,
    pub signed_payload: String,
}

impl NewAssociation {
    pub fn attestation(&self) -> BindingAttestation {
        BindingAttestation {
            medium: self.medium,
            address: self.address.clone(),
            account_id: self.account_id.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            ts: self.created_at,
        }
    }

    pub fn with_sequence_no(self, sequence_no: i64) -> Association {
        Association {
            medium: self.medium,
            address: self.address,
            account_id: self.account_id,
            not_before: self.not_before,
            not_after: self.not_after,
            created_at: self.created_at,
            sequence_no,
            signed_payload: self.signed_payload,
        }
    }
}

/// A persisted, signed binding of `(medium, address)` to `account_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Association {
    pub medium: Medium,
    pub address: String,
    pub account_id: String,
    pub not_before: i64,
    pub not_after: Option<i64>,
    pub created_at: i64,
    pub sequence_no: i64,
    pub signed_payload: String,
}

/// A signed deletion marker that has not been assigned a sequence number yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTombstone {
    pub medium: Medium,
    pub address: String,
    pub account_id: String,
    pub deleted_at: i64,
    pub signed_payload: String,
}

impl NewTombstone {
    pub fn attestation(&self) -> UnbindingAttestation {
        UnbindingAttestation {
            medium: self.medium,
            address: self.address.clone(),
            account_id: self.account_id.clone(),
            deleted_ts: self.deleted_at,
        }
    }
}

/// A sequence entry recording that an association was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub medium: Medium,
    pub address: String,
    pub account_id: String,
    pub deleted_at: i64,
    pub sequence_no: i64,
    pub signed_payload: String,
}

/// One entry of the replication log, in `sequence_no` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Bound(Association),
    Tombstone(Tombstone),
}

impl Change {
    pub fn sequence_no(&self) -> i64 {
        match self {
            Self::Bound(a) => a.sequence_no,
            Self::Tombstone(t) => t.sequence_no,
        }
    }

    pub fn signed_payload(&self) -> &str {
        match self {
            Self::Bound(a) => &a.signed_payload,
            Self::Tombstone(t) => &t.signed_payload,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }
}
