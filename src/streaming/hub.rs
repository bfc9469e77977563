//! Per-session subscriber multiplexing.
//!
//! Each subscriber owns a bounded chunk queue. Fan-out is non-blocking: a
//! full queue drops the chunk for that subscriber only, so a stalled client
//! never holds up the upstream pump or its siblings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// One attached subscriber. The hub owns the sending half of the queue;
/// removal from the hub closes it.
pub struct Subscriber {
    pub id: Uuid,
    pub remote_addr: String,
    pub user_agent: Option<String>,
    pub connected_at: Instant,
    sender: mpsc::Sender<Bytes>,
    dropped_chunks: AtomicU64,
}

impl Subscriber {
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

/// Result of offering one chunk to every attached subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOutcome {
    pub attached: usize,
    pub delivered: usize,
    pub dropped: usize,
}

pub struct BroadcastHub {
    subscribers: RwLock<HashMap<Uuid, Arc<Subscriber>>>,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a new subscriber and hand back the receiving half of its
    /// queue. Ids are unique per hub.
    pub async fn attach(
        &self,
        remote_addr: String,
        user_agent: Option<String>,
    ) -> (Uuid, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let subscriber = Arc::new(Subscriber {
            id: Uuid::new_v4(),
            remote_addr,
            user_agent,
            connected_at: Instant::now(),
            sender,
            dropped_chunks: AtomicU64::new(0),
        });

        let id = subscriber.id;
        let total = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, subscriber);
            subscribers.len()
        };
        info!("subscriber {} attached (total: {})", id, total);
        (id, receiver)
    }

    /// Remove a subscriber, closing its queue. Unknown ids are a no-op.
    pub async fn detach(&self, id: Uuid) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = subscribers.remove(&id).is_some();
        if removed {
            info!("subscriber {} detached (remaining: {})", id, subscribers.len());
        }
        removed
    }

    /// Offer a chunk to every attached subscriber without blocking. The
    /// subscriber set is snapshotted under the read lock so no lock is held
    /// across queue operations.
    pub async fn broadcast(&self, chunk: Bytes) -> BroadcastOutcome {
        let snapshot: Vec<Arc<Subscriber>> = {
            let subscribers = self.subscribers.read().await;
            subscribers.values().cloned().collect()
        };

        let mut outcome = BroadcastOutcome {
            attached: snapshot.len(),
            ..Default::default()
        };

        for subscriber in &snapshot {
            match subscriber.sender.try_send(chunk.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    subscriber.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                    trace!("subscriber {} queue full, chunk dropped", subscriber.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    outcome.dropped += 1;
                    debug!("subscriber {} queue already closed", subscriber.id);
                }
            }
        }

        outcome
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Detach every subscriber, closing all queues. Used by session stop
    /// and blacklisting.
    pub async fn close_all(&self) {
        let mut subscribers = self.subscribers.write().await;
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            info!("closed {} subscriber queues", count);
        }
    }
}
