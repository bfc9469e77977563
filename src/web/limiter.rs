//! Per-user concurrent connection limiting.
//!
//! Counts live subscriber connections per user in memory and refuses new
//! ones past the account's `max_connections`. Permits decrement their count
//! when dropped, so a disconnecting subscriber always frees its slot.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Error, Debug)]
#[error("maximum concurrent connections reached ({current}/{max})")]
pub struct LimitExceeded {
    pub current: u32,
    pub max: u32,
}

pub struct ConnectionLimiter {
    enabled: bool,
    active: Arc<RwLock<HashMap<i64, u32>>>,
}

impl ConnectionLimiter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Claim a connection slot for `user_id`. `max_connections == 0` means
    /// unlimited. Returns `None` when limiting is disabled or unlimited,
    /// otherwise a permit that frees the slot on drop.
    pub async fn acquire(
        &self,
        user_id: i64,
        max_connections: u32,
    ) -> Result<Option<ConnectionPermit>, LimitExceeded> {
        if !self.enabled || max_connections == 0 {
            return Ok(None);
        }

        let mut active = self.active.write().await;
        let count = active.entry(user_id).or_insert(0);
        if *count >= max_connections {
            return Err(LimitExceeded {
                current: *count,
                max: max_connections,
            });
        }
        *count += 1;
        debug!("user {} now holds {} connection(s)", user_id, *count);

        Ok(Some(ConnectionPermit {
            active: self.active.clone(),
            user_id,
        }))
    }

    pub async fn connection_count(&self, user_id: i64) -> u32 {
        self.active.read().await.get(&user_id).copied().unwrap_or(0)
    }
}

/// Releases the user's slot when dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    active: Arc<RwLock<HashMap<i64, u32>>>,
    user_id: i64,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let active = self.active.clone();
        let user_id = self.user_id;
        tokio::spawn(async move {
            let mut active = active.write().await;
            if let Some(count) = active.get_mut(&user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    active.remove(&user_id);
                }
            }
            debug!("user {} released a connection", user_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn enforces_the_per_user_cap() {
        let limiter = ConnectionLimiter::new(true);

        let permit_a = limiter.acquire(1, 2).await.unwrap();
        let _permit_b = limiter.acquire(1, 2).await.unwrap();
        assert_eq!(limiter.connection_count(1).await, 2);

        let err = limiter.acquire(1, 2).await.unwrap_err();
        assert_eq!(err.current, 2);
        assert_eq!(err.max, 2);

        // Another user is unaffected.
        assert!(limiter.acquire(2, 1).await.is_ok());

        drop(permit_a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.connection_count(1).await, 1);
        assert!(limiter.acquire(1, 2).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_limiter_always_admits() {
        let limiter = ConnectionLimiter::new(false);
        for _ in 0..10 {
            assert!(limiter.acquire(1, 1).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn zero_max_means_unlimited() {
        let limiter = ConnectionLimiter::new(true);
        for _ in 0..10 {
            assert!(limiter.acquire(1, 0).await.unwrap().is_none());
        }
    }
}
