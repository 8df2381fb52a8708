//! Per-peer replication cursors.
//!
//! A cursor only ever moves forward; `advance` with a lower value is a no-op.

use chrono::Utc;
use sigil_common::SigilResult;
use sqlx::SqlitePool;

/// Last sequence number acknowledged by `peer`, or 0 if it has never acked.
pub async fn get(pool: &SqlitePool, peer: &str) -> SigilResult<i64> {
    let row: Option<i64> = sqlx::query_scalar(
        "SELECT last_pushed_sequence_no FROM peer_cursors WHERE peer_name = ?",
    )
    .bind(peer)
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or(0))
}

/// Record that `peer` has applied everything up to `sequence_no`.
pub async fn advance(pool: &SqlitePool, peer: &str, sequence_no: i64) -> SigilResult<()> {
    sqlx::query(
        r#"
        INSERT INTO peer_cursors (peer_name, last_pushed_sequence_no, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (peer_name) DO UPDATE SET
            last_pushed_sequence_no = MAX(last_pushed_sequence_no, excluded.last_pushed_sequence_no),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(peer)
    .bind(sequence_no)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}
