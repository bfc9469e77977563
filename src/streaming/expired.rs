//! Expired-notice broadcaster.
//!
//! A singleton stream, separate from the session registry, that loops a
//! static notice video for accounts that are inactive or past expiry. The
//! first attach spawns the looping child; the child is restarted if its
//! output ends while subscribers remain, and exits once the last subscriber
//! detaches. Fan-out follows the hub's non-blocking policy.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::errors::StreamError;
use crate::streaming::ffmpeg;

/// MPEG-TS packets are 188 bytes; read seven at a time.
const NOTICE_READ_CHUNK: usize = 188 * 7;

const RESTART_PAUSE: Duration = Duration::from_millis(500);

pub struct ExpiredNotifier {
    config: Arc<StreamingConfig>,
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<Bytes>>>,
    active: AtomicBool,
}

impl ExpiredNotifier {
    pub fn new(config: Arc<StreamingConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            active: AtomicBool::new(false),
        })
    }

    /// Whether the notice video asset exists. When it does not, callers
    /// fall back to a plain-text notice response.
    pub fn video_available(&self) -> bool {
        self.config.expired_video_path.exists()
    }

    /// Attach a subscriber, lazily starting the looping child.
    pub async fn attach(self: &Arc<Self>) -> (Uuid, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_queue_chunks);
        let id = Uuid::new_v4();
        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, sender);
            info!(
                "expired notice subscriber {} connected (total: {})",
                id,
                subscribers.len()
            );
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(run(self.clone()));
        }

        (id, receiver)
    }

    pub async fn detach(&self, id: Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(&id).is_some() {
            info!(
                "expired notice subscriber {} disconnected (remaining: {})",
                id,
                subscribers.len()
            );
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Whether the looping child's broadcast task is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Offer a chunk to every subscriber; full queues skip the chunk.
    /// Returns the number of attached subscribers.
    async fn broadcast(&self, chunk: Bytes) -> usize {
        let subscribers = self.subscribers.read().await;
        for (id, sender) in subscribers.iter() {
            if sender.try_send(chunk.clone()).is_err() {
                debug!("expired notice subscriber {} queue full, skipping packet", id);
            }
        }
        subscribers.len()
    }
}

async fn run(notifier: Arc<ExpiredNotifier>) {
    info!("starting expired notice stream (looping)");
    loop {
        if notifier.subscriber_count().await == 0 {
            break;
        }
        match play_once(&notifier).await {
            // Output ended while subscribers remain: restart the child.
            Ok(()) => {}
            Err(e) => {
                error!("expired notice stream failed: {}", e);
                break;
            }
        }
        tokio::time::sleep(RESTART_PAUSE).await;
    }
    notifier.active.store(false, Ordering::SeqCst);
    info!("expired notice stream stopped");
}

/// Run the looping child once, broadcasting until its output ends or the
/// last subscriber detaches.
async fn play_once(notifier: &Arc<ExpiredNotifier>) -> Result<(), StreamError> {
    let args = ffmpeg::expired_loop_args(&notifier.config.expired_video_path);
    let mut child = Command::new(&notifier.config.ffmpeg_command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StreamError::Spawn(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| StreamError::Spawn("missing stdout pipe".to_string()))?;

    let mut buf = vec![0u8; NOTICE_READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                warn!("expired notice stream output ended");
                break;
            }
            Ok(n) => {
                let attached = notifier.broadcast(Bytes::copy_from_slice(&buf[..n])).await;
                if attached == 0 {
                    let _ = child.kill().await;
                    break;
                }
            }
            Err(e) => {
                warn!("expired notice stream read error: {}", e);
                break;
            }
        }
    }

    let _ = child.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> Arc<ExpiredNotifier> {
        ExpiredNotifier::new(Arc::new(StreamingConfig {
            ffmpeg_command: "definitely-not-a-real-media-tool".to_string(),
            expired_video_path: "/nonexistent/expired.mp4".into(),
            ..StreamingConfig::default()
        }))
    }

    #[tokio::test]
    async fn video_availability_reflects_filesystem() {
        assert!(!notifier().video_available());
    }

    #[tokio::test]
    async fn attach_detach_round_trip() {
        let notifier = notifier();
        let (id, _rx) = notifier.attach().await;
        assert_eq!(notifier.subscriber_count().await, 1);
        notifier.detach(id).await;
        assert_eq!(notifier.subscriber_count().await, 0);
        // detach of an unknown id is a no-op
        notifier.detach(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let notifier = notifier();
        let (_a, mut rx_a) = notifier.attach().await;
        let (_b, mut rx_b) = notifier.attach().await;

        notifier.broadcast(Bytes::from_static(b"notice")).await;
        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"notice"));
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"notice"));
    }
}
