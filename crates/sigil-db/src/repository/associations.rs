//! Association repository: the local bindings table and replication log.
//!
//! Every mutation takes the identifier's lock, then runs in a single
//! transaction, so the supersede + insert (or deactivate + tombstone) pair is
//! observed atomically and sequence numbers are allocated in commit order
//! per identifier.

use async_trait::async_trait;
use chrono::Utc;
use sigil_common::{
    Association, Change, Medium, NewAssociation, NewTombstone, SigilResult, Tombstone,
};
use sqlx::SqlitePool;

use crate::{locks::KeyedLocks, store::AssociationStore};

pub struct SqlAssociationStore {
    pool: SqlitePool,
    locks: KeyedLocks,
}

impl SqlAssociationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, locks: KeyedLocks::new() }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    sequence_no: i64,
    medium: Medium,
    address: String,
    account_id: String,
    not_before: i64,
    not_after: Option<i64>,
    created_at: i64,
    signed_payload: String,
    tombstone: bool,
}

impl From<LogRow> for Change {
    fn from(row: LogRow) -> Self {
        if row.tombstone {
            Change::Tombstone(Tombstone {
                medium: row.medium,
                address: row.address,
                account_id: row.account_id,
                deleted_at: row.created_at,
                sequence_no: row.sequence_no,
                signed_payload: row.signed_payload,
            })
        } else {
            Change::Bound(Association {
                medium: row.medium,
                address: row.address,
                account_id: row.account_id,
                not_before: row.not_before,
                not_after: row.not_after,
                created_at: row.created_at,
                sequence_no: row.sequence_no,
                signed_payload: row.signed_payload,
            })
        }
    }
}

#[async_trait]
impl AssociationStore for SqlAssociationStore {
    async fn upsert(&self, new: &NewAssociation) -> SigilResult<i64> {
        let _guard = self.locks.lock(new.medium, &new.address).await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE associations SET active = 0 \
             WHERE medium = ? AND address = ? AND active = 1",
        )
        .bind(new.medium)
        .bind(&new.address)
        .execute(&mut *tx)
        .await?;

        let sequence_no: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO associations
                (medium, address, account_id, not_before, not_after,
                 created_at, signed_payload, tombstone, active)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, 1)
            RETURNING sequence_no
            "#,
        )
        .bind(new.medium)
        .bind(&new.address)
        .bind(&new.account_id)
        .bind(new.not_before)
        .bind(new.not_after)
        .bind(new.created_at)
        .bind(&new.signed_payload)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(sequence_no)
    }

    async fn get_active(&self, medium: Medium, address: &str) -> SigilResult<Option<Association>> {
        let now = Utc::now().timestamp_millis();
        let row = sqlx::query_as::<_, Association>(
            r#"
            SELECT medium, address, account_id, not_before, not_after,
                   created_at, sequence_no, signed_payload
            FROM associations
            WHERE medium = ? AND address = ? AND active = 1
              AND not_before <= ?
              AND (not_after IS NULL OR not_after > ?)
            "#,
        )
        .bind(medium)
        .bind(address)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete(
        &self,
        medium: Medium,
        address: &str,
        owner: &str,
        tombstone: &NewTombstone,
    ) -> SigilResult<bool> {
        let _guard = self.locks.lock(medium, address).await;
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let deactivated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE associations SET active = 0
            WHERE medium = ? AND address = ? AND account_id = ? AND active = 1
              AND (not_after IS NULL OR not_after > ?)
            RETURNING sequence_no
            "#,
        )
        .bind(medium)
        .bind(address)
        .bind(owner)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if deactivated.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO associations
                (medium, address, account_id, not_before, not_after,
                 created_at, signed_payload, tombstone, active)
            VALUES (?, ?, ?, ?, NULL, ?, ?, 1, 0)
            "#,
        )
        .bind(medium)
        .bind(address)
        .bind(&tombstone.account_id)
        .bind(tombstone.deleted_at)
        .bind(tombstone.deleted_at)
        .bind(&tombstone.signed_payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn changes_since(&self, cursor: i64, limit: u32) -> SigilResult<Vec<Change>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT sequence_no, medium, address, account_id, not_before, not_after,
                   created_at, signed_payload, tombstone
            FROM associations
            WHERE sequence_no > ?
            ORDER BY sequence_no ASC
            LIMIT ?
            "#,
        )
        .bind(cursor)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Change::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use std::sync::Arc;

    fn binding(address: &str, account: &str) -> NewAssociation {
        let now = Utc::now().timestamp_millis();
        NewAssociation {
            medium: Medium::Email,
            address: address.into(),
            account_id: account.into(),
            not_before: now,
            not_after: None,
            created_at: now,
            signed_payload: format!(r#"{{"mxid":"{account}"}}"#),
        }
    }

    fn tombstone(address: &str, account: &str) -> NewTombstone {
        NewTombstone {
            medium: Medium::Email,
            address: address.into(),
            account_id: account.into(),
            deleted_at: Utc::now().timestamp_millis(),
            signed_payload: r#"{"deleted":true}"#.into(),
        }
    }

    async fn store() -> SqlAssociationStore {
        let db = Database::connect_in_memory().await.unwrap();
        SqlAssociationStore::new(db.pool)
    }

    #[tokio::test]
    async fn rebind_supersedes_previous_binding() {
        let store = store().await;
        let first = store.upsert(&binding("john@example.com", "@john:a.org")).await.unwrap();
        let second = store.upsert(&binding("john@example.com", "@john:b.org")).await.unwrap();
        assert!(second > first);

        let active = store.get_active(Medium::Email, "john@example.com").await.unwrap().unwrap();
        assert_eq!(active.account_id, "@john:b.org");
        assert_eq!(active.sequence_no, second);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM associations WHERE address = ? AND active = 1",
        )
        .bind("john@example.com")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn expired_bindings_are_not_active() {
        let store = store().await;
        let mut expired = binding("old@example.com", "@old:a.org");
        expired.not_before = 0;
        expired.not_after = Some(1);
        store.upsert(&expired).await.unwrap();
        assert!(store.get_active(Medium::Email, "old@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_appends_tombstone_after_binding() {
        let store = store().await;
        let bound = store.upsert(&binding("john@example.com", "@john:a.org")).await.unwrap();

        let removed = store
            .delete(Medium::Email, "john@example.com", "@john:a.org", &tombstone("john@example.com", "@john:a.org"))
            .await
            .unwrap();
        assert!(removed);
        assert!(store.get_active(Medium::Email, "john@example.com").await.unwrap().is_none());

        let changes = store.changes_since(0, 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[1].is_tombstone());
        assert!(changes[1].sequence_no() > bound);
    }

    #[tokio::test]
    async fn delete_requires_matching_owner() {
        let store = store().await;
        store.upsert(&binding("john@example.com", "@john:a.org")).await.unwrap();

        let removed = store
            .delete(Medium::Email, "john@example.com", "@mallory:evil.org", &tombstone("john@example.com", "@mallory:evil.org"))
            .await
            .unwrap();
        assert!(!removed);
        assert!(store.get_active(Medium::Email, "john@example.com").await.unwrap().is_some());
        assert_eq!(store.changes_since(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_unbound_identifier_reports_false() {
        let store = store().await;
        let removed = store
            .delete(Medium::Email, "nobody@example.com", "@x:a.org", &tombstone("nobody@example.com", "@x:a.org"))
            .await
            .unwrap();
        assert!(!removed);
        assert!(store.changes_since(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changes_since_pages_until_caught_up() {
        let store = store().await;
        for i in 0..5 {
            store.upsert(&binding(&format!("user{i}@example.com"), "@u:a.org")).await.unwrap();
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let page = store.changes_since(cursor, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            for change in &page {
                assert!(change.sequence_no() > cursor);
                cursor = change.sequence_no();
                seen.push(cursor);
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn concurrent_binds_leave_one_active_row() {
        let store = Arc::new(store().await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upsert(&binding("race@example.com", &format!("@user{i}:a.org")))
                    .await
                    .unwrap()
            }));
        }
        let mut last = 0;
        for h in handles {
            last = last.max(h.await.unwrap());
        }

        let active = store.get_active(Medium::Email, "race@example.com").await.unwrap().unwrap();
        assert_eq!(active.sequence_no, last);
        assert_eq!(store.changes_since(0, 100).await.unwrap().len(), 8);
    }
}
