//! HTTP-level admission tests.
//!
//! These drive the router directly with `tower::ServiceExt::oneshot`
//! against an in-memory SQLite database, covering the status-code matrix:
//! 401 for missing/invalid credentials, the expired/inactive downgrade, 404
//! for unknown targets and 403 for disabled ones.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use iptv_relay::config::{Config, DatabaseConfig, StreamingConfig};
use iptv_relay::database::Database;
use iptv_relay::streaming::{ffmpeg::MediaToolInfo, ExpiredNotifier, SessionRegistry};
use iptv_relay::web::{router, AppState, ConnectionLimiter};

async fn test_state() -> AppState {
    let database = Database::new(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: Some(1),
    })
    .await
    .unwrap();
    database.migrate().await.unwrap();

    let streaming = StreamingConfig {
        // An unspawnable command plus a long backoff keeps supervisors from
        // interfering with request-level assertions.
        ffmpeg_command: "definitely-not-a-real-media-tool".to_string(),
        restart_backoff: Duration::from_secs(600),
        expired_video_path: "/nonexistent/expired-notification.mp4".into(),
        ..StreamingConfig::default()
    };
    let config = Arc::new(Config {
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: Some(1),
        },
        streaming: streaming.clone(),
        ..Config::default()
    });

    let streaming_config = Arc::new(streaming);
    AppState {
        database,
        config,
        registry: SessionRegistry::new(streaming_config.clone()),
        expired: ExpiredNotifier::new(streaming_config),
        limiter: Arc::new(ConnectionLimiter::new(true)),
        media_tool: MediaToolInfo {
            command: "definitely-not-a-real-media-tool".to_string(),
            available: false,
            version: None,
        },
    }
}

async fn insert_user(state: &AppState, username: &str, is_active: bool, expired: bool) {
    let expires_at = if expired {
        Some(Utc::now() - chrono::Duration::hours(1))
    } else {
        None
    };
    sqlx::query("INSERT INTO users (username, password, is_active, expires_at) VALUES (?, ?, ?, ?)")
        .bind(username)
        .bind(format!("{:x}", md5::compute("pw")))
        .bind(is_active)
        .bind(expires_at)
        .execute(state.database.pool())
        .await
        .unwrap();
}

async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

#[tokio::test]
async fn missing_credentials_return_401() {
    let state = test_state().await;
    let (status, body) = get(state, "/stream/news").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Authentication required"));
}

#[tokio::test]
async fn invalid_credentials_return_401() {
    let state = test_state().await;
    insert_user(&state, "alice", true, false).await;
    let (status, _) = get(state, "/stream/news?username=alice&password=wrong").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn expired_user_is_downgraded_to_the_notice() {
    let state = test_state().await;
    insert_user(&state, "alice", true, true).await;
    // With the notice video asset missing, the downgrade falls back to a
    // plain-text notice rather than a credential error.
    let (status, body) = get(state, "/stream/news?username=alice&password=pw").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("SUBSCRIPTION EXPIRED"));
}

#[tokio::test]
async fn inactive_user_is_downgraded_to_the_notice() {
    let state = test_state().await;
    insert_user(&state, "bob", false, false).await;
    let (status, body) = get(state, "/api/proxy/channel/1?username=bob&password=pw").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("SUBSCRIPTION EXPIRED"));
}

#[tokio::test]
async fn unknown_relay_returns_404() {
    let state = test_state().await;
    insert_user(&state, "alice", true, false).await;
    let (status, _) = get(state, "/stream/missing?username=alice&password=pw").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disabled_relay_returns_403() {
    let state = test_state().await;
    insert_user(&state, "alice", true, false).await;
    sqlx::query(
        "INSERT INTO relays (name, source_urls, output_path, active)
         VALUES ('Old', '[\"http://up/old\"]', 'old', 0)",
    )
    .execute(state.database.pool())
    .await
    .unwrap();

    let (status, body) = get(state, "/stream/old?username=alice&password=pw").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body.contains("disabled"));
}

#[tokio::test]
async fn unknown_channel_returns_404() {
    let state = test_state().await;
    insert_user(&state, "alice", true, false).await;
    let (status, _) = get(state, "/api/proxy/channel/42?username=alice&password=pw").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disabled_channel_returns_403() {
    let state = test_state().await;
    insert_user(&state, "alice", true, false).await;
    sqlx::query("INSERT INTO channels (name, url, active) VALUES ('News', 'http://up/news', 0)")
        .execute(state.database.pool())
        .await
        .unwrap();

    let (status, _) = get(state, "/api/proxy/channel/1?username=alice&password=pw").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stream_status_list_is_empty_json_without_sessions() {
    let state = test_state().await;
    let (status, body) = get(state, "/api/streams/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.trim(), "[]");
}

#[tokio::test]
async fn stream_status_by_key_reports_a_known_session() {
    let state = test_state().await;
    state
        .registry
        .get_or_create(
            "channel_5",
            vec!["http://upstream/live".to_string()],
            iptv_relay::models::OutputFormat::MpegTs,
        )
        .await;

    let (status, body) = get(state, "/api/streams/channel_5/status").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"id\":\"channel_5\""));
    assert!(body.contains("\"output_format\":\"mpegts\""));
}

#[tokio::test]
async fn unknown_stream_status_returns_404() {
    let state = test_state().await;
    let (status, _) = get(state, "/api/streams/channel_1/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_media_tool_state() {
    let state = test_state().await;
    let (status, body) = get(state, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"available\":false"));
}
