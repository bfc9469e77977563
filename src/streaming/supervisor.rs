//! Upstream child-process supervision.
//!
//! One supervisor task runs per active session. Each round it walks the
//! session's candidate URLs in order, pumps the first source that produces
//! output into the ring buffer and the hub, and on child exit applies the
//! retry/backoff/blacklist policy. A source only counts as started once its
//! first read succeeds; sources that spawn but never produce a byte fall
//! through to the next candidate.

use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use crate::errors::StreamError;
use crate::streaming::ffmpeg;
use crate::streaming::session::StreamSession;

struct StartedChild {
    child: Child,
    stdout: ChildStdout,
    first_chunk: Bytes,
    url: String,
}

enum PumpOutcome {
    Cancelled,
    Ended,
}

pub(crate) async fn run(session: Arc<StreamSession>) {
    info!("starting upstream supervisor for session {}", session.key());

    loop {
        session.mark_round_started().await;

        match start_first_available(&session).await {
            Some(started) => {
                info!(
                    "upstream started for session {} from {}",
                    session.key(),
                    started.url
                );
                if let PumpOutcome::Cancelled = pump(started, &session).await {
                    session.set_inactive();
                    info!("upstream stopped (shutdown) for session {}", session.key());
                    return;
                }
            }
            None => {
                if session.is_cancelled() {
                    session.set_inactive();
                    return;
                }
                // Fall through: a round where nothing started is accounted
                // below exactly like an immediate child exit.
            }
        }

        if session.is_cancelled() {
            session.set_inactive();
            info!("upstream stopped (shutdown) for session {}", session.key());
            return;
        }

        let run_duration = session.current_run_duration().await;
        if run_duration < session.config().short_run_threshold {
            let retries = session.record_short_run().await;
            warn!(
                "upstream for session {} died after {:?} (retry {}/{})",
                session.key(),
                run_duration,
                retries,
                session.config().max_short_runs
            );
            if retries >= session.config().max_short_runs {
                session.blacklist().await;
                return;
            }
        } else {
            session.reset_retries();
        }

        tokio::select! {
            _ = session.cancelled() => {
                session.set_inactive();
                info!("upstream stopped (shutdown) for session {}", session.key());
                return;
            }
            _ = tokio::time::sleep(session.config().restart_backoff) => {}
        }

        let keep_running = session.subscriber_count().await > 0 || !session.is_on_demand();
        if !keep_running {
            session.set_inactive();
            info!("upstream stopped (no subscribers) for session {}", session.key());
            return;
        }
        info!(
            "restarting upstream for session {} (attempt {})",
            session.key(),
            session.retry_count() + 1
        );
    }
}

/// Walk the candidate URLs in order; the first one that produces output
/// wins. Remaining candidates are ignored until the next restart round.
async fn start_first_available(session: &Arc<StreamSession>) -> Option<StartedChild> {
    for url in session.source_urls() {
        if session.is_cancelled() {
            return None;
        }
        match try_start(session, url).await {
            Ok(started) => return Some(started),
            Err(StreamError::Stopped) => return None,
            Err(e) => {
                warn!(
                    "upstream source failed for session {}: {} ({})",
                    session.key(),
                    url,
                    e
                );
            }
        }
    }
    error!("all upstream sources failed for session {}", session.key());
    None
}

async fn try_start(session: &Arc<StreamSession>, url: &str) -> Result<StartedChild, StreamError> {
    let args = ffmpeg::relay_args(url);
    let mut command = Command::new(&session.config().ffmpeg_command);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| StreamError::Spawn(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| StreamError::Spawn("missing stdout pipe".to_string()))?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_drain(session.key().to_string(), stderr);
    }

    // The source only counts as started once its first read succeeds.
    let mut buf = vec![0u8; session.config().read_chunk_bytes];
    let first = tokio::select! {
        _ = session.cancelled() => {
            let _ = child.kill().await;
            return Err(StreamError::Stopped);
        }
        result = stdout.read(&mut buf) => result,
    };

    match first {
        Ok(0) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(StreamError::Spawn("no output before end of stream".to_string()))
        }
        Ok(n) => Ok(StartedChild {
            child,
            stdout,
            first_chunk: Bytes::copy_from_slice(&buf[..n]),
            url: url.to_string(),
        }),
        Err(e) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            Err(StreamError::Spawn(e.to_string()))
        }
    }
}

/// Read the child's stdout in chunks and feed each through the session
/// (ring buffer, hub, byte accounting) until EOF or cancellation. The kill
/// on cancellation is deliberate: closing the pipes does not reliably make
/// the media tool exit.
async fn pump(started: StartedChild, session: &Arc<StreamSession>) -> PumpOutcome {
    let StartedChild {
        mut child,
        stdout,
        first_chunk,
        url,
    } = started;

    session.ingest_chunk(first_chunk).await;

    let mut reader = BufReader::new(stdout);
    let mut buf = vec![0u8; session.config().read_chunk_bytes];
    let outcome = loop {
        tokio::select! {
            _ = session.cancelled() => break PumpOutcome::Cancelled,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    info!("upstream ended for session {} ({})", session.key(), url);
                    break PumpOutcome::Ended;
                }
                Ok(n) => {
                    session.ingest_chunk(Bytes::copy_from_slice(&buf[..n])).await;
                }
                Err(e) => {
                    warn!("upstream read error for session {}: {}", session.key(), e);
                    break PumpOutcome::Ended;
                }
            }
        }
    };

    if let PumpOutcome::Cancelled = outcome {
        let _ = child.kill().await;
    }
    let _ = child.wait().await;
    outcome
}

fn spawn_stderr_drain(key: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let lower = line.to_lowercase();
            if lower.contains("error")
                || lower.contains("failed")
                || lower.contains("invalid")
                || lower.contains("could not")
            {
                warn!("media tool for session {}: {}", key, line);
            } else {
                debug!("media tool for session {}: {}", key, line);
            }
        }
    });
}
