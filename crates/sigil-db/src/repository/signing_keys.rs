//! Signing-key repository.
//!
//! Holds the seed of every key this server has signed with. Exactly one row
//! is current; retired rows stay until explicitly pruned so signatures made
//! with them can still be checked.

use sigil_common::SigilResult;
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSigningKey {
    pub version: i64,
    pub algorithm: String,
    pub seed_bytes: Vec<u8>,
    pub public_key: String,
    pub created_at: i64,
    pub is_current: bool,
}

/// Every stored key, oldest version first.
pub async fn load_keys(pool: &SqlitePool) -> SigilResult<Vec<StoredSigningKey>> {
    let rows = sqlx::query_as::<_, StoredSigningKey>(
        "SELECT * FROM signing_keys ORDER BY version ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Persist a new current key, retiring the previous one in the same transaction.
pub async fn insert_current(pool: &SqlitePool, key: &StoredSigningKey) -> SigilResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE signing_keys SET is_current = 0 WHERE is_current = 1")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO signing_keys (version, algorithm, seed_bytes, public_key, created_at, is_current)
        VALUES (?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(key.version)
    .bind(&key.algorithm)
    .bind(&key.seed_bytes)
    .bind(&key.public_key)
    .bind(key.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Remove a retired key. The current key is never deleted.
pub async fn delete_retired(pool: &SqlitePool, version: i64) -> SigilResult<bool> {
    let result = sqlx::query("DELETE FROM signing_keys WHERE version = ? AND is_current = 0")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn key(version: i64) -> StoredSigningKey {
        StoredSigningKey {
            version,
            algorithm: "ed25519".into(),
            seed_bytes: vec![version as u8; 32],
            public_key: format!("pub{version}"),
            created_at: version,
            is_current: true,
        }
    }

    #[tokio::test]
    async fn inserting_a_key_retires_the_previous_one() {
        let db = Database::connect_in_memory().await.unwrap();
        insert_current(&db.pool, &key(1)).await.unwrap();
        insert_current(&db.pool, &key(2)).await.unwrap();

        let keys = load_keys(&db.pool).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys[0].is_current);
        assert!(keys[1].is_current);
        assert_eq!(keys[1].seed_bytes, vec![2u8; 32]);
    }

    #[tokio::test]
    async fn current_key_cannot_be_deleted() {
        let db = Database::connect_in_memory().await.unwrap();
        insert_current(&db.pool, &key(1)).await.unwrap();
        insert_current(&db.pool, &key(2)).await.unwrap();

        assert!(!delete_retired(&db.pool, 2).await.unwrap());
        assert!(delete_retired(&db.pool, 1).await.unwrap());
        assert_eq!(load_keys(&db.pool).await.unwrap().len(), 1);
    }
}
