//! Stream target resolution (channels and named relays).

use sqlx::{Pool, Row, Sqlite};
use tracing::warn;

use crate::models::{ResolvedChannel, ResolvedRelay};

#[derive(Clone)]
pub struct TargetRepository {
    pool: Pool<Sqlite>,
}

impl TargetRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Look up a channel by id. The `active` flag is returned rather than
    /// filtered so disabled channels can be reported distinctly from
    /// missing ones.
    pub async fn resolve_channel(&self, id: i64) -> Result<Option<ResolvedChannel>, sqlx::Error> {
        let row = sqlx::query("SELECT id, name, url, active FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ResolvedChannel {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            active: row.try_get::<i64, _>("active")? != 0,
        }))
    }

    /// Look up a relay by output path. `source_urls` is stored as a JSON
    /// array of failover URLs.
    pub async fn resolve_relay(&self, path: &str) -> Result<Option<ResolvedRelay>, sqlx::Error> {
        let row =
            sqlx::query("SELECT id, output_path, source_urls, active FROM relays WHERE output_path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_urls: String = row.try_get("source_urls")?;
        let source_urls: Vec<String> = serde_json::from_str(&raw_urls).unwrap_or_else(|e| {
            warn!("relay {} has malformed source_urls: {}", path, e);
            Vec::new()
        });

        Ok(Some(ResolvedRelay {
            id: row.try_get("id")?,
            output_path: row.try_get("output_path")?,
            source_urls,
            active: row.try_get::<i64, _>("active")? != 0,
        }))
    }
}
