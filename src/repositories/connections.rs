//! Connection tracking for subscriber sessions.

use sqlx::{Pool, Sqlite};
use tracing::debug;

#[derive(Clone)]
pub struct ConnectionRepository {
    pool: Pool<Sqlite>,
}

impl ConnectionRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Record a new subscriber connection and return its row id.
    pub async fn open(
        &self,
        user_id: i64,
        channel_id: Option<i64>,
        remote_addr: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_connections (user_id, channel_id, ip_address, connected_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(user_id)
        .bind(channel_id)
        .bind(remote_addr)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Stamp the disconnect time. The guard below calls this exactly once.
    pub async fn close(&self, connection_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE user_connections SET disconnected_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(connection_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a connection record wrapped in a guard that closes it on drop.
    /// Tracking failures are logged and tolerated; they never block a
    /// subscriber from streaming.
    pub async fn open_guarded(
        &self,
        user_id: i64,
        channel_id: Option<i64>,
        remote_addr: &str,
    ) -> Option<ConnectionGuard> {
        match self.open(user_id, channel_id, remote_addr).await {
            Ok(connection_id) => Some(ConnectionGuard {
                repository: self.clone(),
                connection_id,
            }),
            Err(e) => {
                debug!("failed to record connection for user {}: {}", user_id, e);
                None
            }
        }
    }
}

/// Stamps `disconnected_at` when the owning subscriber stream is dropped.
pub struct ConnectionGuard {
    repository: ConnectionRepository,
    connection_id: i64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let repository = self.repository.clone();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            if let Err(e) = repository.close(connection_id).await {
                debug!("failed to close connection record {}: {}", connection_id, e);
            }
        });
    }
}
