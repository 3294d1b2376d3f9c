use std::collections::HashMap;
use std::time::{
    Duration,
    Instant,
};

use tokio::sync::Mutex;

/// Suppresses repeats of the same condition message within a minimum
/// interval. Persistent per-node failures repeat on every retry loop; the
/// operator only needs one message per window.
pub struct NotifyLimiter {
    min_interval: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl NotifyLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now()).await
    }

    async fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut map = self.last_sent.lock().await;
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_send_allowed_repeat_suppressed() {
        let limiter = NotifyLimiter::new(Duration::from_secs(20));
        let t0 = Instant::now();
        assert!(limiter.allow_at("node de1 ssh failed", t0).await);
        assert!(!limiter.allow_at("node de1 ssh failed", t0 + Duration::from_secs(5)).await);
        assert!(limiter.allow_at("node de1 ssh failed", t0 + Duration::from_secs(25)).await);
    }

    #[tokio::test]
    async fn distinct_conditions_do_not_interfere() {
        let limiter = NotifyLimiter::new(Duration::from_secs(20));
        let t0 = Instant::now();
        assert!(limiter.allow_at("a", t0).await);
        assert!(limiter.allow_at("b", t0).await);
    }
}
