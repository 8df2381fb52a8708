//! Store contracts consumed by the binder and the replication pusher.
//!
//! The SQL implementations live in [`crate::repository`]; tests may swap in
//! their own implementations.

use async_trait::async_trait;
use sigil_common::{
    Association, Change, InviteToken, Medium, NewAssociation, NewTombstone, SigilResult,
};

/// Durable table of bound identifier → account associations.
#[async_trait]
pub trait AssociationStore: Send + Sync {
    /// Supersede any active association for the identifier and insert the
    /// replacement as one atomic unit. Returns the new row's sequence number.
    async fn upsert(&self, association: &NewAssociation) -> SigilResult<i64>;

    /// The active, unexpired association for the identifier, if any.
    async fn get_active(&self, medium: Medium, address: &str) -> SigilResult<Option<Association>>;

    /// Deactivate the identifier's association if it is bound to `owner`,
    /// appending `tombstone` at a fresh sequence position.
    ///
    /// Returns `false` (and writes nothing) when no such association exists.
    async fn delete(
        &self,
        medium: Medium,
        address: &str,
        owner: &str,
        tombstone: &NewTombstone,
    ) -> SigilResult<bool>;

    /// Up to `limit` log entries with `sequence_no > cursor`, ascending.
    async fn changes_since(&self, cursor: i64, limit: u32) -> SigilResult<Vec<Change>>;
}

/// Durable table of pending room invites.
#[async_trait]
pub trait InviteTokenStore: Send + Sync {
    async fn store_token(
        &self,
        medium: Medium,
        address: &str,
        room_id: &str,
        sender: &str,
        token: &str,
    ) -> SigilResult<InviteToken>;

    /// Undelivered tokens for the identifier, oldest first.
    async fn get_tokens(&self, medium: Medium, address: &str) -> SigilResult<Vec<InviteToken>>;

    /// Up to `limit` undelivered tokens across all identifiers, oldest first.
    async fn undelivered(&self, limit: u32) -> SigilResult<Vec<InviteToken>>;

    async fn mark_sent(&self, id: i64, sent_ts: i64) -> SigilResult<()>;

    async fn delete_token(&self, id: i64) -> SigilResult<()>;

    /// Delete undelivered tokens received before `cutoff_ts`. Returns the count.
    async fn prune_received_before(&self, cutoff_ts: i64) -> SigilResult<u64>;
}
