//! Media tool command construction.
//!
//! The relay child remuxes a live source to MPEG-TS on stdout without
//! transcoding. Both output modes use the same mux; the HLS variant differs
//! only in the content type advertised upstream of here.

use std::path::Path;

use tracing::warn;

/// Arguments for a live relay child reading `source_url`.
pub fn relay_args(source_url: &str) -> Vec<String> {
    [
        "-threads",
        "1",
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "5",
        // 10 second I/O timeout, in microseconds
        "-timeout",
        "10000000",
        "-fflags",
        "+genpts+discardcorrupt",
        "-flags",
        "low_delay",
        // analyse at most 5 seconds / 5MB of input so every stream is
        // detected without delaying startup
        "-analyzeduration",
        "5000000",
        "-probesize",
        "5000000",
        "-i",
        source_url,
        // optional maps: don't fail when video or audio is missing
        "-map",
        "0:v?",
        "-map",
        "0:a?",
        "-c",
        "copy",
        "-f",
        "mpegts",
        "-avoid_negative_ts",
        "make_zero",
        "-max_muxing_queue_size",
        "9999",
        // re-emit SPS/PPS on keyframes so late joiners can decode
        "-bsf:v",
        "h264_mp4toannexb,dump_extra",
        "-async",
        "1",
        "-vsync",
        "cfr",
        "-start_at_zero",
        "-copytb",
        "1",
        "pipe:1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Arguments for the expired-notice child: loop a static file forever at
/// native frame rate, codecs copied, MPEG-TS to stdout.
pub fn expired_loop_args(video_path: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-stream_loop", "-1", "-re", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(video_path.display().to_string());
    args.extend(
        [
            "-c",
            "copy",
            "-f",
            "mpegts",
            "-avoid_negative_ts",
            "make_zero",
            "-max_muxing_queue_size",
            "9999",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args
}

/// Availability and version of the configured media tool, probed once at
/// startup with `<command> -version`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MediaToolInfo {
    pub command: String,
    pub available: bool,
    pub version: Option<String>,
}

pub async fn probe_media_tool(command: &str) -> MediaToolInfo {
    match tokio::process::Command::new(command)
        .arg("-version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            // First line looks like "ffmpeg version 6.1.1-..."; take the
            // third token as the version.
            let version = stdout.lines().next().and_then(|line| {
                line.split_whitespace().nth(2).map(|v| v.to_string())
            });
            MediaToolInfo {
                command: command.to_string(),
                available: true,
                version,
            }
        }
        Ok(output) => {
            warn!("media tool '{}' exited with status {}", command, output.status);
            MediaToolInfo {
                command: command.to_string(),
                available: false,
                version: None,
            }
        }
        Err(e) => {
            warn!("failed to execute media tool '{}': {}", command, e);
            MediaToolInfo {
                command: command.to_string(),
                available: false,
                version: None,
            }
        }
    }
}
