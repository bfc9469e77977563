//! Per-request admission for streaming endpoints.
//!
//! Credentials arrive as `username`/`password` query parameters, the way
//! IPTV players embed them in playlist URLs. Inactive and expired accounts
//! are deliberately not rejected: they are routed to the expired-notice
//! stream instead. That downgrade is a product contract, not leniency.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;

use crate::database::Database;
use crate::models::UserCredential;
use crate::repositories::UserRepository;

#[derive(Debug, Deserialize)]
pub struct StreamAuthQuery {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Outcome of a successful credential check.
pub enum Admission {
    /// Stream the requested target.
    Granted(UserCredential),
    /// Account inactive or past expiry: serve the notice stream with 200.
    Notice(UserCredential),
}

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Authentication required: username and password parameters missing")]
    MissingCredentials,
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdmissionError::MissingCredentials | AdmissionError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            AdmissionError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Verify the request's credentials and decide between normal streaming and
/// the expired-notice downgrade.
pub async fn admit(
    database: &Database,
    query: &StreamAuthQuery,
) -> Result<Admission, AdmissionError> {
    let (Some(username), Some(password)) = (query.username.as_deref(), query.password.as_deref())
    else {
        return Err(AdmissionError::MissingCredentials);
    };
    if username.is_empty() || password.is_empty() {
        return Err(AdmissionError::MissingCredentials);
    }

    let users = UserRepository::new(database.pool().clone());
    let Some(user) = users.verify(username, password).await? else {
        return Err(AdmissionError::InvalidCredentials);
    };

    if !user.is_active || user.is_expired(Utc::now()) {
        return Ok(Admission::Notice(user));
    }
    Ok(Admission::Granted(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use chrono::Duration;

    async fn test_database() -> Database {
        let database = Database::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
        })
        .await
        .unwrap();
        database.migrate().await.unwrap();
        database
    }

    async fn insert_user(database: &Database, username: &str, is_active: bool, expires_in: Option<i64>) {
        let expires_at = expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
        sqlx::query(
            "INSERT INTO users (username, password, is_active, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(format!("{:x}", md5::compute("pw")))
        .bind(is_active)
        .bind(expires_at)
        .execute(database.pool())
        .await
        .unwrap();
    }

    fn query(username: Option<&str>, password: Option<&str>) -> StreamAuthQuery {
        StreamAuthQuery {
            username: username.map(String::from),
            password: password.map(String::from),
        }
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let database = test_database().await;
        let result = admit(&database, &query(None, None)).await;
        assert!(matches!(result, Err(AdmissionError::MissingCredentials)));
        let result = admit(&database, &query(Some("alice"), None)).await;
        assert!(matches!(result, Err(AdmissionError::MissingCredentials)));
    }

    #[tokio::test]
    async fn wrong_password_is_invalid() {
        let database = test_database().await;
        insert_user(&database, "alice", true, None).await;
        let result = admit(&database, &query(Some("alice"), Some("nope"))).await;
        assert!(matches!(result, Err(AdmissionError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn valid_active_user_is_granted() {
        let database = test_database().await;
        insert_user(&database, "alice", true, Some(3600)).await;
        let result = admit(&database, &query(Some("alice"), Some("pw"))).await.unwrap();
        assert!(matches!(result, Admission::Granted(_)));
    }

    #[tokio::test]
    async fn expired_and_inactive_users_get_the_notice() {
        let database = test_database().await;
        insert_user(&database, "expired", true, Some(-1)).await;
        insert_user(&database, "disabled", false, None).await;

        let result = admit(&database, &query(Some("expired"), Some("pw"))).await.unwrap();
        assert!(matches!(result, Admission::Notice(_)));

        let result = admit(&database, &query(Some("disabled"), Some("pw"))).await.unwrap();
        assert!(matches!(result, Admission::Notice(_)));
    }
}
