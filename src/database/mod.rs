use crate::config::DatabaseConfig;
use crate::errors::AppError;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite};

/// Shared SQLite handle for the collaborator tables.
///
/// The streaming core only reads `users`, `channels` and `relays`, and
/// opens/closes rows in `user_connections`.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        password TEXT NOT NULL,
        full_name TEXT,
        email TEXT,
        max_connections INTEGER NOT NULL DEFAULT 1,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        expires_at DATETIME,
        notes TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        playlist_id INTEGER,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        logo TEXT,
        group_name TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS relays (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        source_urls TEXT NOT NULL,
        output_path TEXT UNIQUE NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        channel_id INTEGER,
        ip_address TEXT,
        connected_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        disconnected_at DATETIME
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_user_connections_open
    ON user_connections (user_id, disconnected_at)
    "#,
];

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, AppError> {
        // Create the database file if it doesn't exist (for SQLite)
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(10))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema. Statements are idempotent so this can run
    /// unconditionally at startup.
    pub async fn migrate(&self) -> Result<(), AppError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
        };
        let database = Database::new(&config).await.unwrap();
        database.migrate().await.unwrap();
        database.migrate().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(database.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
