use std::collections::{
    HashMap,
    VecDeque,
};
use std::net::IpAddr;
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex,
};
use std::time::{
    Duration,
    Instant,
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};
use xguard_commons::models::node_model::NodeSpec;

use crate::ssh;

use super::backend::{
    self,
    Backend,
};
use super::script;

pub const PENDING_CAP: usize = 20_000;
const DRAIN_MAX: usize = 500;
const WAKE_INTERVAL: Duration = Duration::from_millis(250);
const FAILURE_PAUSE: Duration = Duration::from_millis(500);
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);
const LATENCY_WINDOW: usize = 1_000;
const METRICS_INTERVAL: Duration = Duration::from_secs(30);
const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct PendingEntry {
    pub ttl_secs: u64,
    pub enqueued_at: Instant,
}

/// Per-node pending-ban slot. Bounded; the lock is held only around slot
/// mutations, never across a suspension point.
pub struct PendingBans {
    inner: Mutex<PendingInner>,
    notify: Notify,
    dropped: AtomicU64,
}

struct PendingInner {
    order: VecDeque<IpAddr>,
    entries: HashMap<IpAddr, PendingEntry>,
    last_overflow_warn: Option<Instant>,
}

impl Default for PendingBans {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingBans {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                last_overflow_warn: None,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Accept an address into the slot. An already-pending address has its
    /// TTL raised to the maximum of old and new, even when the slot is at
    /// capacity; a new distinct address past the cap is refused and counted.
    pub fn enqueue(&self, addr: IpAddr, ttl_secs: u64) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().expect("pending lock");
            if let Some(entry) = inner.entries.get_mut(&addr) {
                entry.ttl_secs = entry.ttl_secs.max(ttl_secs);
                true
            } else if inner.entries.len() >= PENDING_CAP {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let warn_due = inner
                    .last_overflow_warn
                    .is_none_or(|t| t.elapsed() >= OVERFLOW_WARN_INTERVAL);
                if warn_due {
                    inner.last_overflow_warn = Some(Instant::now());
                    warn!(
                        "pending-ban slot full ({PENDING_CAP}), dropping {addr}; dropped_total={}",
                        self.dropped.load(Ordering::Relaxed)
                    );
                }
                false
            } else {
                inner.entries.insert(
                    addr,
                    PendingEntry {
                        ttl_secs,
                        enqueued_at: Instant::now(),
                    },
                );
                inner.order.push_back(addr);
                true
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Take up to `max` entries in enqueue order.
    pub fn drain(&self, max: usize) -> Vec<(IpAddr, PendingEntry)> {
        let mut inner = self.inner.lock().expect("pending lock");
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(addr) = inner.order.pop_front() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&addr) {
                batch.push((addr, entry));
            }
        }
        batch
    }

    /// Put a failed batch back at the head of the queue, preserving order
    /// and keeping the maximum TTL if the address was re-enqueued meanwhile.
    pub fn requeue(&self, items: Vec<(IpAddr, PendingEntry)>) {
        let mut inner = self.inner.lock().expect("pending lock");
        for (addr, entry) in items.into_iter().rev() {
            let merged = match inner.entries.remove(&addr) {
                Some(existing) => PendingEntry {
                    ttl_secs: existing.ttl_secs.max(entry.ttl_secs),
                    enqueued_at: existing.enqueued_at.min(entry.enqueued_at),
                },
                None => entry,
            };
            inner.order.retain(|a| a != &addr);
            inner.entries.insert(addr, merged);
            inner.order.push_front(addr);
        }
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("pending lock").entries.len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn ttl_of(&self, addr: &IpAddr) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(addr)
            .map(|e| e.ttl_secs)
    }
}

#[derive(Default)]
struct WorkerMetrics {
    samples: VecDeque<Duration>,
    last_batch_size: usize,
    last_batch_latency: Duration,
}

impl WorkerMetrics {
    fn record_batch(&mut self, latencies: &[Duration], batch_latency: Duration) {
        for lat in latencies {
            if self.samples.len() == LATENCY_WINDOW {
                self.samples.pop_front();
            }
            self.samples.push_back(*lat);
        }
        self.last_batch_size = latencies.len();
        self.last_batch_latency = batch_latency;
    }

    fn p95(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() as f64 * 0.95).ceil() as usize;
        Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
    }
}

pub(super) fn spawn_worker(
    spec: NodeSpec, queue: Arc<PendingBans>, cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_worker(spec, queue, cancel).await;
    })
}

/// Per-node batching loop: wake every 250ms (or on enqueue), drain up to 500
/// pending bans, submit one remote batch, flush conntrack for each address.
/// A failing batch is requeued with max-TTL and retried after a short pause.
async fn run_worker(spec: NodeSpec, queue: Arc<PendingBans>, cancel: CancellationToken) {
    let mut metrics = WorkerMetrics::default();
    let mut last_metrics = Instant::now();
    debug!("ban worker started node={}", spec.name);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("ban worker stopped node={}", spec.name);
                return;
            }
            _ = queue.notify.notified() => {}
            _ = tokio::time::sleep(WAKE_INTERVAL) => {}
        }

        let batch = queue.drain(DRAIN_MAX);
        if !batch.is_empty() {
            let backend = backend::detect_backend(&spec).await;
            if backend == Backend::None {
                if backend::cached_backend(&spec) == Some(Backend::None) {
                    // confirmed bare host, enforcement stays disabled
                    warn!(
                        "node={} has no firewall backend, discarding {} pending bans",
                        spec.name,
                        batch.len()
                    );
                } else {
                    // probe failed transiently, keep the batch for retry
                    queue.requeue(batch);
                    tokio::time::sleep(FAILURE_PAUSE).await;
                }
            } else {
                let items: Vec<(IpAddr, u64)> =
                    batch.iter().map(|(a, e)| (*a, e.ttl_secs)).collect();
                let cmd = script::batch_script(backend, &items);
                let submitted = Instant::now();
                let result = ssh::run_capture(&spec, &cmd, BATCH_TIMEOUT).await;
                match result {
                    Ok(out) if out.success() => {
                        let done = Instant::now();
                        let latencies: Vec<Duration> = batch
                            .iter()
                            .map(|(_, e)| done.duration_since(e.enqueued_at))
                            .collect();
                        metrics.record_batch(&latencies, done.duration_since(submitted));
                        debug!(
                            "node={} banned batch of {} addrs",
                            spec.name,
                            batch.len()
                        );
                    }
                    Ok(out) => {
                        warn!(
                            "ban batch failed node={} rc={} size={}, requeueing",
                            spec.name,
                            out.exit_code,
                            batch.len()
                        );
                        queue.requeue(batch);
                        tokio::time::sleep(FAILURE_PAUSE).await;
                    }
                    Err(e) => {
                        warn!(
                            "ban batch failed node={} err={e} size={}, requeueing",
                            spec.name,
                            batch.len()
                        );
                        queue.requeue(batch);
                        tokio::time::sleep(FAILURE_PAUSE).await;
                    }
                }
            }
        }

        if last_metrics.elapsed() >= METRICS_INTERVAL {
            last_metrics = Instant::now();
            info!(
                "ban worker node={} p95_ms={} last_batch={} last_batch_ms={} pending={} dropped={}",
                spec.name,
                metrics
                    .p95()
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                metrics.last_batch_size,
                metrics.last_batch_latency.as_millis(),
                queue.depth(),
                queue.dropped_total()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000u32 + n))
    }

    #[test]
    fn dedupe_keeps_max_ttl() {
        let q = PendingBans::new();
        assert!(q.enqueue(addr(1), 100));
        assert!(q.enqueue(addr(1), 600));
        assert_eq!(q.depth(), 1);
        assert_eq!(q.ttl_of(&addr(1)), Some(600));
        // a lower TTL never shortens the pending one
        assert!(q.enqueue(addr(1), 50));
        assert_eq!(q.ttl_of(&addr(1)), Some(600));
    }

    #[test]
    fn overflow_refuses_new_but_raises_existing() {
        let q = PendingBans::new();
        for i in 0..PENDING_CAP as u32 {
            assert!(q.enqueue(addr(i), 100));
        }
        assert_eq!(q.depth(), PENDING_CAP);
        // new distinct address refused and counted
        assert!(!q.enqueue(addr(PENDING_CAP as u32 + 1), 600));
        assert_eq!(q.depth(), PENDING_CAP);
        assert_eq!(q.dropped_total(), 1);
        // TTL raise on an already-pending address still succeeds
        assert!(q.enqueue(addr(7), 600));
        assert_eq!(q.ttl_of(&addr(7)), Some(600));
    }

    #[test]
    fn drain_preserves_enqueue_order() {
        let q = PendingBans::new();
        q.enqueue(addr(3), 10);
        q.enqueue(addr(1), 10);
        q.enqueue(addr(2), 10);
        let batch = q.drain(2);
        let addrs: Vec<IpAddr> = batch.iter().map(|(a, _)| *a).collect();
        assert_eq!(addrs, vec![addr(3), addr(1)]);
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn requeue_puts_items_back_in_front_with_max_ttl() {
        let q = PendingBans::new();
        q.enqueue(addr(1), 100);
        q.enqueue(addr(2), 100);
        let batch = q.drain(2);
        // addr(1) re-enqueued with a higher ttl while its batch was in flight
        q.enqueue(addr(1), 900);
        q.requeue(batch);
        assert_eq!(q.depth(), 2);
        assert_eq!(q.ttl_of(&addr(1)), Some(900));
        let drained = q.drain(10);
        let addrs: Vec<IpAddr> = drained.iter().map(|(a, _)| *a).collect();
        // original order restored ahead of anything newer
        assert_eq!(addrs[0], addr(1));
        assert_eq!(addrs[1], addr(2));
    }

    #[test]
    fn p95_over_rolling_window() {
        let mut m = WorkerMetrics::default();
        let lat: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        m.record_batch(&lat, Duration::from_millis(5));
        assert_eq!(m.p95(), Some(Duration::from_millis(95)));
        assert_eq!(m.last_batch_size, 100);
    }
}
