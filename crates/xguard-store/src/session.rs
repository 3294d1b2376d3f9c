use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::time::{
    Duration,
    SystemTime,
    UNIX_EPOCH,
};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{
    debug,
    warn,
};

use crate::error::StoreError;

const SESSION_PREFIX: &str = "a:";
const BAN_PREFIX: &str = "banned:";
/// Idle slots are forgotten after this long; falling out of retention is not
/// a ban.
const SLOT_RETENTION_SECS: i64 = 6 * 3600;
const OP_TIMEOUT_SECS: u64 = 5;
const CONNECT_TIMEOUT_SECS: u64 = 5;
const HEALTH_INTERVAL_SECS: u64 = 30;
const DEGRADED_LOG_INTERVAL_SECS: u64 = 60;
const SCAN_BATCH: usize = 100;

fn session_key(inbound: &str, user: &str) -> String {
    format!("{SESSION_PREFIX}{inbound}:{user}")
}

fn ban_key(addr: &str) -> String {
    format!("{BAN_PREFIX}{addr}")
}

/// Splits `a:<inbound>:<user>` back into its parts. The user identifier is
/// opaque and may itself contain colons, so only the first two separators
/// are structural.
fn parse_session_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(SESSION_PREFIX)?;
    let (inbound, user) = rest.split_once(':')?;
    if inbound.is_empty() || user.is_empty() {
        return None;
    }
    Some((inbound.to_string(), user.to_string()))
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub inbound: String,
    pub user: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BannedEntry {
    pub address: String,
    pub remaining_secs: i64,
}

/// Client for the shared session-state store. All cross-watcher coordination
/// (slot trimming, ban dedup) goes through here; every call is bounded by a
/// wall-clock timeout so a slow store never wedges a watcher.
pub struct SessionStore {
    conn: ConnectionManager,
    last_degraded_log: AtomicU64,
}

impl SessionStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| StoreError::Timeout(CONNECT_TIMEOUT_SECS))??;
        Ok(Self {
            conn,
            last_degraded_log: AtomicU64::new(0),
        })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// Periodic reachability probe. Runs until the owning task is aborted.
    pub async fn health_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(HEALTH_INTERVAL_SECS)).await;
            if let Err(e) = self.ping().await {
                warn!("store health check failed: {e}");
            }
        }
    }

    /// Record `addr` as last-seen-now in the (inbound, user) slot and trim
    /// the slot to `limit`, oldest first. Returns the evicted addresses in
    /// oldest-first order plus whether the address was new to the slot.
    ///
    /// Degrades to `(empty, false)` when the store is slow or unreachable:
    /// no evictions means no spurious bans, at the cost of temporary
    /// under-detection.
    pub async fn add_address(
        &self, inbound: &str, user: &str, addr: &str, limit: u32,
    ) -> (Vec<String>, bool) {
        match self.try_add_address(inbound, user, addr, limit).await {
            Ok(res) => res,
            Err(e) => {
                self.log_degraded(&e);
                (Vec::new(), false)
            }
        }
    }

    async fn try_add_address(
        &self, inbound: &str, user: &str, addr: &str, limit: u32,
    ) -> Result<(Vec<String>, bool), StoreError> {
        let key = session_key(inbound, user);
        let addr = addr.to_string();
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let (added, count, _): (i64, i64, i64) = redis::pipe()
                .zadd(&key, &addr, now_unix())
                .zcard(&key)
                .expire(&key, SLOT_RETENTION_SECS)
                .query_async(&mut conn)
                .await?;
            let mut evicted: Vec<String> = Vec::new();
            if count > limit as i64 {
                let overflow = (count - limit as i64) as isize;
                let oldest: Vec<String> = conn.zrange(&key, 0, overflow - 1).await?;
                if !oldest.is_empty() {
                    let _: i64 = conn.zrem(&key, &oldest).await?;
                    evicted = oldest;
                }
            }
            Ok((evicted, added == 1))
        })
        .await
    }

    /// Set the recent-ban marker. An existing marker with a longer remaining
    /// TTL is left untouched; the longer TTL always wins.
    pub async fn mark_banned(&self, addr: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let key = ban_key(addr);
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let remaining: i64 = conn.ttl(&key).await?;
            if remaining >= ttl_secs as i64 {
                debug!("ban marker {key} keeps longer ttl {remaining}s");
                return Ok(());
            }
            let _: () = conn.set_ex(&key, 1u8, ttl_secs).await?;
            Ok(())
        })
        .await
    }

    pub async fn is_banned_recent(&self, addr: &str) -> bool {
        let key = ban_key(addr);
        let mut conn = self.conn.clone();
        let res = self
            .bounded(async move {
                let n: i64 = conn.exists(&key).await?;
                Ok(n == 1)
            })
            .await;
        match res {
            Ok(v) => v,
            Err(e) => {
                self.log_degraded(&e);
                false
            }
        }
    }

    /// Paginated scan of live (inbound, user) slots for the control plane.
    pub async fn list_active(&self, limit: usize) -> Result<Vec<ActiveSession>, StoreError> {
        let keys = self.scan_keys(&format!("{SESSION_PREFIX}*"), limit).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((inbound, user)) = parse_session_key(&key) else {
                continue;
            };
            let mut conn = self.conn.clone();
            let addresses: Vec<String> = self
                .bounded(async move { Ok(conn.zrange(&key, 0, -1).await?) })
                .await?;
            sessions.push(ActiveSession {
                inbound,
                user,
                addresses,
            });
        }
        Ok(sessions)
    }

    pub async fn list_banned(&self, limit: usize) -> Result<Vec<BannedEntry>, StoreError> {
        let keys = self.scan_keys(&format!("{BAN_PREFIX}*"), limit).await?;
        let mut banned = Vec::with_capacity(keys.len());
        for key in keys {
            let mut conn = self.conn.clone();
            let k = key.clone();
            let remaining: i64 = self.bounded(async move { Ok(conn.ttl(&k).await?) }).await?;
            let address = key.trim_start_matches(BAN_PREFIX).to_string();
            banned.push(BannedEntry {
                address,
                remaining_secs: remaining,
            });
        }
        Ok(banned)
    }

    pub async fn unmark_banned(&self, addr: &str) -> Result<bool, StoreError> {
        let key = ban_key(addr);
        let mut conn = self.conn.clone();
        self.bounded(async move {
            let n: i64 = conn.del(&key).await?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn unmark_all_banned(&self) -> Result<usize, StoreError> {
        let keys = self.scan_keys(&format!("{BAN_PREFIX}*"), usize::MAX).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len();
        for chunk in keys.chunks(SCAN_BATCH) {
            let chunk = chunk.to_vec();
            let mut conn = self.conn.clone();
            self.bounded(async move {
                let _: i64 = conn.del(&chunk).await?;
                Ok(())
            })
            .await?;
        }
        Ok(count)
    }

    async fn scan_keys(&self, pattern: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = pattern.to_string();
        self.bounded(async move {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if keys.len() >= limit || next == 0 {
                    keys.truncate(limit);
                    return Ok(keys);
                }
                cursor = next;
            }
        })
        .await
    }

    async fn bounded<T>(
        &self, fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(Duration::from_secs(OP_TIMEOUT_SECS), fut)
            .await
            .map_err(|_| StoreError::Timeout(OP_TIMEOUT_SECS))?
    }

    fn log_degraded(&self, err: &StoreError) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let last = self.last_degraded_log.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= DEGRADED_LOG_INTERVAL_SECS
            && self
                .last_degraded_log
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!("store degraded, treating as no evictions: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_round_trip() {
        let key = session_key("VMESS_TCP", "42.alice");
        assert_eq!(key, "a:VMESS_TCP:42.alice");
        assert_eq!(
            parse_session_key(&key),
            Some(("VMESS_TCP".to_string(), "42.alice".to_string()))
        );
    }

    #[test]
    fn session_key_user_may_contain_colons() {
        let key = session_key("VLESS_WS", "u:with:colons");
        assert_eq!(
            parse_session_key(&key),
            Some(("VLESS_WS".to_string(), "u:with:colons".to_string()))
        );
    }

    #[test]
    fn malformed_session_keys_are_skipped() {
        assert_eq!(parse_session_key("banned:1.2.3.4"), None);
        assert_eq!(parse_session_key("a:onlyinbound"), None);
        assert_eq!(parse_session_key("a::user"), None);
    }

    #[test]
    fn ban_key_prefix() {
        assert_eq!(ban_key("203.0.113.5"), "banned:203.0.113.5");
        assert_eq!(ban_key("2001:db8::1"), "banned:2001:db8::1");
    }
}
