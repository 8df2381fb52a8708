//! Associations received from replication peers.
//!
//! Rows are keyed by `(origin_server, origin_sequence_no)`. For any
//! `(origin_server, medium, address)` only the record with the highest origin
//! sequence number is kept, so batches can be applied repeatedly and in any
//! order with the same end state.

use sigil_common::{Medium, SigilResult};
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReplicatedAssociation {
    pub origin_server: String,
    pub origin_sequence_no: i64,
    pub medium: Medium,
    pub address: String,
    pub account_id: String,
    pub not_before: i64,
    pub not_after: Option<i64>,
    pub created_at: i64,
    pub signed_payload: String,
    pub tombstone: bool,
}

#[derive(Clone)]
pub struct ReplicatedAssociationStore {
    pool: SqlitePool,
}

impl ReplicatedAssociationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply one record. Returns `true` if it became the latest record for its
    /// origin and identifier, `false` if it was a duplicate or stale.
    pub async fn apply(&self, record: &ReplicatedAssociation) -> SigilResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO replicated_associations
                (origin_server, origin_sequence_no, medium, address, account_id,
                 not_before, not_after, created_at, signed_payload, tombstone)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM replicated_associations
                WHERE origin_server = ? AND medium = ? AND address = ?
                  AND origin_sequence_no >= ?
            )
            "#,
        )
        .bind(&record.origin_server)
        .bind(record.origin_sequence_no)
        .bind(record.medium)
        .bind(&record.address)
        .bind(&record.account_id)
        .bind(record.not_before)
        .bind(record.not_after)
        .bind(record.created_at)
        .bind(&record.signed_payload)
        .bind(record.tombstone)
        .bind(&record.origin_server)
        .bind(record.medium)
        .bind(&record.address)
        .bind(record.origin_sequence_no)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            sqlx::query(
                r#"
                DELETE FROM replicated_associations
                WHERE origin_server = ? AND medium = ? AND address = ?
                  AND origin_sequence_no < ?
                "#,
            )
            .bind(&record.origin_server)
            .bind(record.medium)
            .bind(&record.address)
            .bind(record.origin_sequence_no)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(origin: &str, seq: i64, account: &str, tombstone: bool) -> ReplicatedAssociation {
        ReplicatedAssociation {
            origin_server: origin.into(),
            origin_sequence_no: seq,
            medium: Medium::Email,
            address: "john@example.com".into(),
            account_id: account.into(),
            not_before: 0,
            not_after: None,
            created_at: seq,
            signed_payload: "{}".into(),
            tombstone,
        }
    }

    async fn store() -> ReplicatedAssociationStore {
        let db = Database::connect_in_memory().await.unwrap();
        ReplicatedAssociationStore::new(db.pool)
    }

    /// Newest live binding across origins; a tombstone hides its origin's row.
    async fn live_binding(store: &ReplicatedAssociationStore) -> Option<ReplicatedAssociation> {
        sqlx::query_as::<_, ReplicatedAssociation>(
            "SELECT * FROM replicated_associations WHERE medium = ? AND address = ? AND NOT tombstone \
             ORDER BY created_at DESC, origin_sequence_no DESC LIMIT 1",
        )
        .bind(Medium::Email)
        .bind("john@example.com")
        .fetch_optional(&store.pool)
        .await
        .unwrap()
    }

    async fn row_count(store: &ReplicatedAssociationStore) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM replicated_associations")
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reapplying_a_record_is_a_no_op() {
        let store = store().await;
        let r = record("peer.org", 3, "@john:a.org", false);
        assert!(store.apply(&r).await.unwrap());
        assert!(!store.apply(&r).await.unwrap());
        assert_eq!(row_count(&store).await, 1);
        assert_eq!(live_binding(&store).await, Some(r));
    }

    #[tokio::test]
    async fn stale_record_does_not_override_newer_one() {
        let store = store().await;
        let newer = record("peer.org", 7, "@john:b.org", false);
        let older = record("peer.org", 5, "@john:a.org", false);

        assert!(store.apply(&newer).await.unwrap());
        assert!(!store.apply(&older).await.unwrap());

        let found = live_binding(&store).await.unwrap();
        assert_eq!(found.account_id, "@john:b.org");
        assert_eq!(row_count(&store).await, 1);
    }

    #[tokio::test]
    async fn tombstone_hides_binding_from_same_origin() {
        let store = store().await;
        store.apply(&record("peer.org", 1, "@john:a.org", false)).await.unwrap();
        store.apply(&record("peer.org", 2, "@john:a.org", true)).await.unwrap();

        assert!(live_binding(&store).await.is_none());
        assert_eq!(row_count(&store).await, 1);
    }

    #[tokio::test]
    async fn origins_are_tracked_independently() {
        let store = store().await;
        store.apply(&record("one.org", 10, "@john:one.org", false)).await.unwrap();
        assert!(store.apply(&record("two.org", 1, "@john:two.org", false)).await.unwrap());
        assert_eq!(row_count(&store).await, 2);

        let found = live_binding(&store).await.unwrap();
        assert_eq!(found.origin_server, "one.org");
    }
}
