//! Domain types shared between the streaming engine, the admission gate,
//! and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container label for a session's output.
///
/// Both modes currently emit MPEG-TS bytes; the HLS variant only changes the
/// advertised content type and the session key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    MpegTs,
    Hls,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::MpegTs => "video/MP2T",
            OutputFormat::Hls => "application/vnd.apple.mpegurl",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::MpegTs => "mpegts",
            OutputFormat::Hls => "hls",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time statistics for one session.
///
/// `download_mbps`/`upload_mbps` are megabits per second averaged over the
/// session's sliding sample window.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: String,
    pub active: bool,
    pub clients: usize,
    pub output_format: OutputFormat,
    pub uptime_seconds: f64,
    pub last_activity: DateTime<Utc>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

/// A verified end-user credential, as read by the admission gate.
#[derive(Debug, Clone)]
pub struct UserCredential {
    pub id: i64,
    pub username: String,
    pub max_connections: u32,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserCredential {
    /// A credential with no expiry never expires; one expiring exactly now
    /// is already expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }
}

/// A directly proxied channel, resolved by id.
#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub active: bool,
}

/// A named relay with failover sources, resolved by output path.
#[derive(Debug, Clone)]
pub struct ResolvedRelay {
    pub id: i64,
    pub output_path: String,
    pub source_urls: Vec<String>,
    pub active: bool,
}
