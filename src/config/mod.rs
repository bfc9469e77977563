use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::AppError;

pub mod duration_serde;

use duration_serde::duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub web: WebConfig,
    pub database: DatabaseConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Base URL advertised in generated playlist entries.
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

/// Tunables for the streaming fan-out engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Media tool executable, looked up on PATH unless absolute.
    pub ffmpeg_command: String,
    /// How long an on-demand session may sit with zero subscribers before
    /// the reaper stops and removes it.
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
    /// Reaper tick interval.
    #[serde(with = "duration")]
    pub reaper_interval: Duration,
    /// A child that exits before running this long counts as a failure.
    #[serde(with = "duration")]
    pub short_run_threshold: Duration,
    /// Pause between upstream restart attempts.
    #[serde(with = "duration")]
    pub restart_backoff: Duration,
    /// Consecutive short runs before the session is blacklisted.
    pub max_short_runs: u32,
    /// Per-subscriber queue capacity, in chunks.
    pub subscriber_queue_chunks: usize,
    /// Capacity of the recent-bytes ring buffer.
    pub ring_buffer_bytes: usize,
    /// Read size for the child stdout pump.
    pub read_chunk_bytes: usize,
    /// Video looped to inactive or expired accounts.
    pub expired_video_path: PathBuf,
    /// Enforce per-user concurrent connection caps at admission.
    pub enforce_connection_limits: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./iptv-relay.db".to_string(),
            max_connections: Some(10),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: "ffmpeg".to_string(),
            idle_timeout: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(10),
            short_run_threshold: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(2),
            max_short_runs: 2,
            subscriber_queue_chunks: 2000,
            ring_buffer_bytes: 5 * 1024 * 1024,
            read_chunk_bytes: 8192,
            expired_video_path: PathBuf::from("./static/expired-notification.mp4"),
            enforce_connection_limits: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, writing the defaults out when
    /// the file does not exist yet. Environment overrides are applied on
    /// top: `HOST`, `PORT`, `PUBLIC_BASE_URL`, `DATABASE_URL`.
    pub fn load(config_file: &str) -> Result<Self, AppError> {
        let mut config = if std::path::Path::new(config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            toml::from_str(&contents).map_err(|e| AppError::Configuration {
                message: format!("{config_file}: {e}"),
            })?
        } else {
            let default_config = Self::default();
            let contents =
                toml::to_string_pretty(&default_config).map_err(|e| AppError::Configuration {
                    message: e.to_string(),
                })?;
            std::fs::write(config_file, contents)?;
            default_config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.web.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.web.port = port;
            }
        }
        if let Ok(base_url) = std::env::var("PUBLIC_BASE_URL") {
            self.web.base_url = base_url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.streaming.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.streaming.reaper_interval, Duration::from_secs(10));
        assert_eq!(config.streaming.short_run_threshold, Duration::from_secs(30));
        assert_eq!(config.streaming.restart_backoff, Duration::from_secs(2));
        assert_eq!(config.streaming.max_short_runs, 2);
        assert_eq!(config.streaming.subscriber_queue_chunks, 2000);
        assert_eq!(config.streaming.read_chunk_bytes, 8192);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.web.port, config.web.port);
        assert_eq!(parsed.streaming.idle_timeout, config.streaming.idle_timeout);
    }

    #[test]
    fn partial_config_uses_defaults_for_missing_sections() {
        let parsed: Config = toml::from_str(
            r#"
            [streaming]
            idle_timeout = "90s"
            max_short_runs = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.streaming.idle_timeout, Duration::from_secs(90));
        assert_eq!(parsed.streaming.max_short_runs, 3);
        assert_eq!(parsed.web.port, 8080);
        assert_eq!(parsed.streaming.subscriber_queue_chunks, 2000);
    }
}
