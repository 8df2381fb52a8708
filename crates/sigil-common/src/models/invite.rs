//! Pending room invites addressed to a third-party identifier.

use serde::{Deserialize, Serialize};

use super::Medium;

/// A room invite waiting for its identifier to be bound.
///
/// `sent_ts` stays `None` until the onBind notification for this token has
/// been delivered. Delivered tokens are deleted unless retention is
/// configured, in which case they are kept but never delivered again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InviteToken {
    pub id: i64,
    pub medium: Medium,
    pub address: String,
    pub room_id: String,
    pub sender: String,
    pub token: String,
    /// Unix millisecond timestamp the invite was stored at.
    pub received_ts: i64,
    pub sent_ts: Option<i64>,
}

impl InviteToken {
    pub fn is_delivered(&self) -> bool {
        self.sent_ts.is_some()
    }

    /// Whether the invite outlived `validity_ms` at time `now_ms`.
    pub fn is_expired(&self, validity_ms: Option<i64>, now_ms: i64) -> bool {
        validity_ms.is_some_and(|v| self.received_ts.saturating_add(v) <= now_ms)
    }
}
