//! Invite-token repository.
//!
//! Tokens are write-once. Delivery either deletes the row or stamps
//! `sent_ts`; every read used for delivery filters on `sent_ts IS NULL`, so a
//! retained token is never handed out twice.

use async_trait::async_trait;
use chrono::Utc;
use sigil_common::{InviteToken, Medium, SigilResult};
use sqlx::SqlitePool;

use crate::store::InviteTokenStore;

pub struct SqlInviteTokenStore {
    pool: SqlitePool,
}

impl SqlInviteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InviteTokenStore for SqlInviteTokenStore {
    async fn store_token(
        &self,
        medium: Medium,
        address: &str,
        room_id: &str,
        sender: &str,
        token: &str,
    ) -> SigilResult<InviteToken> {
        let row = sqlx::query_as::<_, InviteToken>(
            r#"
            INSERT INTO invite_tokens (medium, address, room_id, sender, token, received_ts)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(medium)
        .bind(address)
        .bind(room_id)
        .bind(sender)
        .bind(token)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_tokens(&self, medium: Medium, address: &str) -> SigilResult<Vec<InviteToken>> {
        let rows = sqlx::query_as::<_, InviteToken>(
            r#"
            SELECT * FROM invite_tokens
            WHERE medium = ? AND address = ? AND sent_ts IS NULL
            ORDER BY id ASC
            "#,
        )
        .bind(medium)
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn undelivered(&self, limit: u32) -> SigilResult<Vec<InviteToken>> {
        let rows = sqlx::query_as::<_, InviteToken>(
            "SELECT * FROM invite_tokens WHERE sent_ts IS NULL ORDER BY id ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_sent(&self, id: i64, sent_ts: i64) -> SigilResult<()> {
        sqlx::query("UPDATE invite_tokens SET sent_ts = ? WHERE id = ? AND sent_ts IS NULL")
            .bind(sent_ts)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_token(&self, id: i64) -> SigilResult<()> {
        sqlx::query("DELETE FROM invite_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_received_before(&self, cutoff_ts: i64) -> SigilResult<u64> {
        let result = sqlx::query(
            "DELETE FROM invite_tokens WHERE sent_ts IS NULL AND received_ts < ?",
        )
        .bind(cutoff_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
