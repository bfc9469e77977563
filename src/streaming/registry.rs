//! Process-wide session registry with idle reaping.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::StreamingConfig;
use crate::models::{OutputFormat, SessionStats};
use crate::streaming::session::StreamSession;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    config: Arc<StreamingConfig>,
}

impl SessionRegistry {
    /// Create the registry and start its background reaper. The reaper
    /// holds only a weak reference, so dropping the registry ends it.
    pub fn new(config: Arc<StreamingConfig>) -> Arc<Self> {
        let registry = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        });
        Self::spawn_reaper(&registry);
        registry
    }

    fn spawn_reaper(registry: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(registry);
        let interval = registry.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                registry.reap_idle().await;
            }
        });
    }

    /// Return the existing session for `key`, refreshing its activity, or
    /// construct a new idle one. Two concurrent callers with the same key
    /// observe the same session.
    pub async fn get_or_create(
        &self,
        key: &str,
        source_urls: Vec<String>,
        format: OutputFormat,
    ) -> Arc<StreamSession> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(key) {
            existing.touch().await;
            return existing.clone();
        }

        let session = StreamSession::new(key.to_string(), source_urls, format, self.config.clone());
        sessions.insert(key.to_string(), session.clone());
        info!("created session {} (format: {})", key, format);
        session
    }

    pub async fn get(&self, key: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Stats for every session that currently has subscribers and a
    /// running upstream.
    pub async fn list_active(&self) -> Vec<SessionStats> {
        let snapshot: Vec<Arc<StreamSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut stats = Vec::new();
        for session in snapshot {
            if session.is_active() && session.subscriber_count().await > 0 {
                stats.push(session.stats().await);
            }
        }
        stats
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop and remove on-demand sessions that have sat idle with no
    /// subscribers longer than the configured timeout.
    async fn reap_idle(&self) {
        let mut sessions = self.sessions.write().await;
        let mut to_remove = Vec::new();
        for (key, session) in sessions.iter() {
            if !session.is_on_demand() {
                continue;
            }
            if session.subscriber_count().await == 0
                && session.idle_for().await > self.config.idle_timeout
            {
                to_remove.push(key.clone());
            }
        }

        for key in to_remove {
            if let Some(session) = sessions.remove(&key) {
                info!(
                    "session {} idle for more than {:?}, stopping",
                    key, self.config.idle_timeout
                );
                session.stop().await;
            }
        }
    }

    /// Stop every session. Used at process shutdown.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        debug!("shutting down {} sessions", sessions.len());
        for (_, session) in sessions.drain() {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(idle_timeout: Duration, reaper_interval: Duration) -> Arc<StreamingConfig> {
        Arc::new(StreamingConfig {
            ffmpeg_command: "definitely-not-a-real-media-tool".to_string(),
            idle_timeout,
            reaper_interval,
            restart_backoff: Duration::from_secs(600),
            ..StreamingConfig::default()
        })
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = SessionRegistry::new(test_config(
            Duration::from_secs(60),
            Duration::from_secs(10),
        ));
        let a = registry
            .get_or_create("channel_7", vec!["http://upA/s".to_string()], OutputFormat::MpegTs)
            .await;
        let b = registry
            .get_or_create("channel_7", vec![], OutputFormat::MpegTs)
            .await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_key() {
        let registry = SessionRegistry::new(test_config(
            Duration::from_secs(60),
            Duration::from_secs(10),
        ));
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn reaper_removes_idle_on_demand_sessions() {
        let registry = SessionRegistry::new(test_config(
            Duration::from_millis(100),
            Duration::from_millis(50),
        ));
        registry
            .get_or_create("channel_9", vec![], OutputFormat::MpegTs)
            .await;
        assert_eq!(registry.session_count().await, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn reaper_leaves_always_on_sessions_alone() {
        let registry = SessionRegistry::new(test_config(
            Duration::from_millis(100),
            Duration::from_millis(50),
        ));
        let session = registry
            .get_or_create("relay_main", vec![], OutputFormat::MpegTs)
            .await;
        session.set_on_demand(false);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn recreated_session_starts_with_fresh_retry_state() {
        let registry = SessionRegistry::new(test_config(
            Duration::from_millis(100),
            Duration::from_millis(50),
        ));
        let first = registry
            .get_or_create("channel_11", vec![], OutputFormat::MpegTs)
            .await;
        first.blacklist().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.session_count().await, 0);

        let second = registry
            .get_or_create("channel_11", vec![], OutputFormat::MpegTs)
            .await;
        assert!(!second.is_blacklisted());
        assert_eq!(second.retry_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let registry = SessionRegistry::new(test_config(
            Duration::from_secs(60),
            Duration::from_secs(10),
        ));
        let session = registry
            .get_or_create("channel_12", vec![], OutputFormat::MpegTs)
            .await;
        registry.shutdown().await;
        assert_eq!(registry.session_count().await, 0);
        assert!(session.is_stopped());
    }
}
