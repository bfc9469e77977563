//! Credential verification.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};

use crate::models::UserCredential;

#[derive(Clone)]
pub struct UserRepository {
    pool: Pool<Sqlite>,
}

impl UserRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Verify a username/plaintext-password pair against the stored MD5
    /// digest. Returns `None` when no user matches; activity and expiry are
    /// the caller's decision.
    pub async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserCredential>, sqlx::Error> {
        let digest = format!("{:x}", md5::compute(password));

        let row = sqlx::query(
            r#"
            SELECT id, username, max_connections, is_active, expires_at
            FROM users
            WHERE username = ? AND password = ?
            "#,
        )
        .bind(username)
        .bind(&digest)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(UserCredential {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            max_connections: row.try_get::<i64, _>("max_connections")? as u32,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            expires_at: row.try_get::<Option<DateTime<Utc>>, _>("expires_at")?,
        }))
    }
}
