//! One logical channel output.
//!
//! A session owns its broadcast hub, its recent-bytes ring buffer, and the
//! lifecycle of the single upstream child process driven by the supervisor
//! task. Sessions are created by the registry and shared as `Arc`s; the
//! supervisor and subscribers hold clones, never independent lifetimes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::StreamError;
use crate::models::{OutputFormat, SessionStats};
use crate::streaming::hub::{BroadcastHub, BroadcastOutcome};
use crate::streaming::ring_buffer::RingBuffer;
use crate::streaming::supervisor;

const BANDWIDTH_WINDOW_SAMPLES: usize = 10;

pub struct StreamSession {
    key: String,
    source_urls: Vec<String>,
    format: OutputFormat,
    config: Arc<StreamingConfig>,
    hub: BroadcastHub,
    ring: RingBuffer,
    cancel: CancellationToken,
    active: AtomicBool,
    blacklisted: AtomicBool,
    on_demand: AtomicBool,
    retry_count: AtomicU32,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    started_at: RwLock<Instant>,
    last_activity: RwLock<Instant>,
    last_failure: RwLock<Option<Instant>>,
    window: Mutex<BandwidthWindow>,
}

impl StreamSession {
    pub(crate) fn new(
        key: String,
        source_urls: Vec<String>,
        format: OutputFormat,
        config: Arc<StreamingConfig>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            key,
            source_urls,
            format,
            hub: BroadcastHub::new(config.subscriber_queue_chunks),
            ring: RingBuffer::new(config.ring_buffer_bytes),
            config,
            cancel: CancellationToken::new(),
            active: AtomicBool::new(false),
            blacklisted: AtomicBool::new(false),
            on_demand: AtomicBool::new(true),
            retry_count: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            started_at: RwLock::new(now),
            last_activity: RwLock::new(now),
            last_failure: RwLock::new(None),
            window: Mutex::new(BandwidthWindow::default()),
        })
    }

    /// Register a subscriber, lazily starting the supervisor on the first
    /// attach. Fails fast when the session is blacklisted or stopped.
    pub async fn attach(
        self: &Arc<Self>,
        remote_addr: String,
        user_agent: Option<String>,
    ) -> Result<(Uuid, mpsc::Receiver<Bytes>), StreamError> {
        if self.blacklisted.load(Ordering::SeqCst) {
            return Err(StreamError::Blacklisted);
        }
        if self.cancel.is_cancelled() {
            return Err(StreamError::Stopped);
        }

        let (id, receiver) = self.hub.attach(remote_addr, user_agent).await;
        self.touch().await;

        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(supervisor::run(self.clone()));
        }

        Ok((id, receiver))
    }

    /// Remove a subscriber. Unknown ids are a no-op.
    pub async fn detach(&self, id: Uuid) {
        self.hub.detach(id).await;
        self.touch().await;
    }

    /// When on-demand is off the session survives zero subscribers and the
    /// reaper leaves it alone (always-on relay).
    pub fn set_on_demand(&self, on_demand: bool) {
        self.on_demand.store(on_demand, Ordering::SeqCst);
    }

    pub fn is_on_demand(&self) -> bool {
        self.on_demand.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub async fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count().await
    }

    /// Cancel the session context, kill the child and close every
    /// subscriber queue. The supervisor observes the cancellation and
    /// performs the kill; drain loops observe their closed queues and exit.
    pub async fn stop(&self) {
        info!("stopping session {}", self.key);
        self.cancel.cancel();
        self.hub.close_all().await;
    }

    /// Snapshot statistics, feeding the sliding bandwidth window with the
    /// current byte counters.
    pub async fn stats(&self) -> SessionStats {
        let bytes_read = self.bytes_read.load(Ordering::Relaxed);
        let bytes_written = self.bytes_written.load(Ordering::Relaxed);
        let (download_mbps, upload_mbps) = self
            .window
            .lock()
            .await
            .record(Instant::now(), bytes_read, bytes_written);

        let last_activity_elapsed = self.last_activity.read().await.elapsed();
        let last_activity =
            Utc::now() - chrono::Duration::from_std(last_activity_elapsed).unwrap_or_default();

        SessionStats {
            id: self.key.clone(),
            active: self.is_active(),
            clients: self.subscriber_count().await,
            output_format: self.format,
            uptime_seconds: self.started_at.read().await.elapsed().as_secs_f64(),
            last_activity,
            bytes_read,
            bytes_written,
            download_mbps,
            upload_mbps,
        }
    }

    pub(crate) async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub(crate) async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    // --- supervisor-facing internals ---

    pub(crate) fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub(crate) fn source_urls(&self) -> &[String] {
        &self.source_urls
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn set_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stamp the start of an upstream round; uptime and the short-run
    /// failure decision measure from here.
    pub(crate) async fn mark_round_started(&self) {
        *self.started_at.write().await = Instant::now();
    }

    pub(crate) async fn current_run_duration(&self) -> Duration {
        self.started_at.read().await.elapsed()
    }

    /// Account a short run; returns the consecutive failure count.
    pub(crate) async fn record_short_run(&self) -> u32 {
        *self.last_failure.write().await = Some(Instant::now());
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_retries(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    /// Consecutive short-run failures since the last healthy run.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Terminal failure state: stop restarting and drop every subscriber so
    /// their drain loops end. New attaches are rejected until the registry
    /// destroys this session.
    pub(crate) async fn blacklist(&self) {
        self.blacklisted.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        warn!(
            "session {} blacklisted after {} consecutive failures, source likely offline",
            self.key,
            self.retry_count()
        );
        self.hub.close_all().await;
    }

    /// Feed one upstream chunk through the ring buffer and the hub, and
    /// account bytes in and out. Dropped chunks do not count as written.
    pub(crate) async fn ingest_chunk(&self, chunk: Bytes) -> BroadcastOutcome {
        let n = chunk.len() as u64;
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
        self.ring.write(&chunk).await;
        let outcome = self.hub.broadcast(chunk).await;
        self.bytes_written
            .fetch_add(n * outcome.delivered as u64, Ordering::Relaxed);
        outcome
    }
}

/// Sliding window of byte-counter samples used to derive megabit-per-second
/// rates over roughly the last ten stats polls.
#[derive(Default)]
struct BandwidthWindow {
    samples: VecDeque<(Instant, u64, u64)>,
}

impl BandwidthWindow {
    /// Append a sample and return `(download_mbps, upload_mbps)` computed
    /// between the oldest and newest samples in the window.
    fn record(&mut self, at: Instant, bytes_read: u64, bytes_written: u64) -> (f64, f64) {
        self.samples.push_back((at, bytes_read, bytes_written));
        while self.samples.len() > BANDWIDTH_WINDOW_SAMPLES {
            self.samples.pop_front();
        }

        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return (0.0, 0.0);
        };
        let seconds = newest.0.duration_since(oldest.0).as_secs_f64();
        if self.samples.len() < 2 || seconds <= 0.0 {
            return (0.0, 0.0);
        }

        let read_delta = newest.1.saturating_sub(oldest.1) as f64;
        let written_delta = newest.2.saturating_sub(oldest.2) as f64;
        let download_mbps = (read_delta * 8.0 / seconds) / 1024.0 / 1024.0;
        let upload_mbps = (written_delta * 8.0 / seconds) / 1024.0 / 1024.0;
        (download_mbps, upload_mbps)
    }
}
