use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use xguard_commons::models::node_model::NodeSpec;
use xguard_notify::{
    NotifyLimiter,
    TelegramNotifier,
};
use xguard_store::SessionStore;

use crate::firewall::FirewallEnforcer;
use crate::parser::{
    self,
    ACCEPT_TOKEN,
    USER_TOKEN,
};
use crate::ssh;
use crate::stream::{
    self,
    Sentinel,
    StreamEvent,
};

const FD_THRESHOLD: u32 = 10;
const FD_WINDOW: Duration = Duration::from_secs(600);
const REBOOT_GRACE: Duration = Duration::from_secs(60);
const REBOOT_COOLDOWN: Duration = Duration::from_secs(20 * 60);
const FD_NOTIFY_MILESTONES: [u32; 4] = [3, 5, 8, 10];

const BAN_BATCH_WINDOW: Duration = Duration::from_secs(5);
const BAN_BATCH_MAX: usize = 10;

const STATS_INTERVAL: Duration = Duration::from_secs(60);
/// In-loop escalations (reboot cooldown holds) repeat no faster than this.
const LOOP_NOTIFY_INTERVAL: Duration = Duration::from_secs(30);

/// Best-effort ladder; the first variant the node's sudo policy allows wins.
const REBOOT_CMD: &str = "sudo -n reboot || sudo -n /sbin/reboot || sudo -n systemctl reboot || sudo -n shutdown -r now || reboot || /sbin/reboot || systemctl reboot || shutdown -r now";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    Attached,
    Abusing,
    Detached,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootDecision {
    Hold,
    Announce,
    CooldownHold,
    Reboot,
}

/// Tracks fd-unreadable occurrences in a rolling window and arbitrates the
/// automatic-reboot escalation: threshold, then a grace period, then at most
/// one reboot per cooldown.
pub struct RebootGovernor {
    window_start: Option<Instant>,
    count: u32,
    scheduled_at: Option<Instant>,
    last_reboot: Option<Instant>,
}

impl Default for RebootGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl RebootGovernor {
    pub fn new() -> Self {
        Self {
            window_start: None,
            count: 0,
            scheduled_at: None,
            last_reboot: None,
        }
    }

    /// Count one fd-unreadable sentinel; returns the count within the
    /// current window.
    pub fn record_fd_unreadable(&mut self, now: Instant) -> u32 {
        let expired = self
            .window_start
            .is_none_or(|start| now.duration_since(start) > FD_WINDOW);
        if expired {
            self.window_start = Some(now);
            self.count = 0;
            self.scheduled_at = None;
        }
        self.count += 1;
        self.count
    }

    pub fn decide(&mut self, now: Instant) -> RebootDecision {
        if self.count < FD_THRESHOLD {
            return RebootDecision::Hold;
        }
        match self.scheduled_at {
            None => {
                self.scheduled_at = Some(now);
                RebootDecision::Announce
            }
            Some(scheduled) => {
                if now.duration_since(scheduled) < REBOOT_GRACE {
                    RebootDecision::Hold
                } else if self
                    .last_reboot
                    .is_some_and(|last| now.duration_since(last) <= REBOOT_COOLDOWN)
                {
                    RebootDecision::CooldownHold
                } else {
                    self.last_reboot = Some(now);
                    self.count = 0;
                    self.window_start = Some(now);
                    self.scheduled_at = None;
                    RebootDecision::Reboot
                }
            }
        }
    }

    /// A successful attach clears the pending escalation.
    pub fn reset_on_attach(&mut self, now: Instant) {
        self.count = 0;
        self.window_start = Some(now);
        self.scheduled_at = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEvent {
    pub address: String,
    pub user: String,
    pub inbound: String,
    pub success_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
}

/// Coalesces bursty ban events into one operator message per window, with a
/// size cap forcing an early flush under attack.
pub struct BanBatcher {
    window: Duration,
    max: usize,
    buf: Vec<BanEvent>,
    last_sent: Option<Instant>,
}

impl BanBatcher {
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            buf: Vec::new(),
            last_sent: None,
        }
    }

    pub fn push(&mut self, event: BanEvent, now: Instant) -> Option<Vec<BanEvent>> {
        self.buf.push(event);
        let due = self.buf.len() >= self.max
            || self
                .last_sent
                .is_none_or(|t| now.duration_since(t) >= self.window);
        if due {
            self.last_sent = Some(now);
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    /// Flush a partially-filled batch once its window has elapsed.
    pub fn take_if_due(&mut self, now: Instant) -> Option<Vec<BanEvent>> {
        if self.buf.is_empty()
            || self
                .last_sent
                .is_some_and(|t| now.duration_since(t) < self.window)
        {
            return None;
        }
        self.last_sent = Some(now);
        Some(std::mem::take(&mut self.buf))
    }
}

/// User identifiers carry a numeric panel prefix (`42.alice`); operator
/// messages show the bare name while the store keys stay raw.
pub fn display_user(user: &str) -> &str {
    match user.split_once('.') {
        Some((prefix, rest)) if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) => {
            rest
        }
        _ => user,
    }
}

/// Dependencies shared by every watcher in the fleet.
pub struct WatcherContext {
    pub store: Arc<SessionStore>,
    pub firewall: Arc<FirewallEnforcer>,
    pub notifier: Option<Arc<TelegramNotifier>>,
    pub limiter: Arc<NotifyLimiter>,
    pub limits: HashMap<String, u32>,
    pub ban_seconds: u64,
    pub all_nodes: Vec<NodeSpec>,
}

pub struct NodeWatcher {
    spec: NodeSpec,
    ctx: Arc<WatcherContext>,
    state: NodeState,
    governor: RebootGovernor,
    batcher: BanBatcher,
    loop_limiter: NotifyLimiter,
    lines: u64,
    parsed: u64,
    last_stat: Instant,
}

impl NodeWatcher {
    pub fn new(spec: NodeSpec, ctx: Arc<WatcherContext>) -> Self {
        Self {
            spec,
            ctx,
            state: NodeState::Starting,
            governor: RebootGovernor::new(),
            batcher: BanBatcher::new(BAN_BATCH_WINDOW, BAN_BATCH_MAX),
            loop_limiter: NotifyLimiter::new(LOOP_NOTIFY_INTERVAL),
            lines: 0,
            parsed: 0,
            last_stat: Instant::now(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = self.ctx.firewall.ensure_rules(&self.spec, false).await {
            warn!("firewall ensure failed node={}: {e}", self.spec.name);
            self.notify_limited(&format!("ensure-failed:{}", self.spec.name), &format!(
                "⚠️ Node {}: firewall setup failed ({e}); enforcement degraded until it recovers.",
                self.spec.name
            ))
            .await;
        }

        let mut events = stream::spawn_supervisor(self.spec.clone(), cancel.child_token());
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    if let Some(batch) = self.batcher.take_if_due(Instant::now()) {
                        self.send_ban_message(batch).await;
                    }
                    self.maybe_log_stats();
                }
                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Sentinel { kind, raw } => self.handle_sentinel(kind, &raw).await,
            StreamEvent::Line(line) => self.handle_line(&line).await,
            StreamEvent::Ended { exit_code } => {
                self.state = NodeState::Reconnecting;
                self.notify_limited(
                    &format!("stream-ended:{}", self.spec.name),
                    &format!(
                        "⚠️ Node {}: log stream ended (rc={exit_code}), reconnecting...",
                        self.spec.name
                    ),
                )
                .await;
            }
        }
    }

    async fn handle_sentinel(&mut self, kind: Sentinel, raw: &str) {
        match kind {
            Sentinel::Attach { container } => {
                debug!("node={} attach container={container}", self.spec.name);
            }
            Sentinel::FollowPid(pid) => {
                self.governor.reset_on_attach(Instant::now());
                if self.state != NodeState::Attached {
                    self.state = NodeState::Attached;
                    self.notify(&format!(
                        "Node {} attached and streaming logs (pid={pid}).",
                        self.spec.name
                    ))
                    .await;
                }
            }
            Sentinel::FdUnreadable => {
                let now = Instant::now();
                let count = self.governor.record_fd_unreadable(now);
                if FD_NOTIFY_MILESTONES.contains(&count) {
                    self.notify_limited(
                        &format!("fd-unreadable:{}:{count}", self.spec.name),
                        &format!(
                            "⚠️ Node {}: xray output unreadable (fd_unreadable x{count}).",
                            self.spec.name
                        ),
                    )
                    .await;
                }
                match self.governor.decide(now) {
                    RebootDecision::Hold => {}
                    RebootDecision::Announce => {
                        self.notify(&format!(
                            "⚠️ Node {}: repeated read failures (fd_unreadable x{count}). Rebooting in 60s unless it recovers.",
                            self.spec.name
                        ))
                        .await;
                    }
                    RebootDecision::CooldownHold => {
                        if self
                            .loop_limiter
                            .allow(&format!("reboot-cooldown:{}", self.spec.name))
                            .await
                        {
                            self.notify(&format!(
                                "⏳ Node {}: fd_unreadable persists but reboot is in cooldown.",
                                self.spec.name
                            ))
                            .await;
                        }
                    }
                    RebootDecision::Reboot => self.issue_reboot().await,
                }
            }
            Sentinel::NoContainer => {
                self.state = NodeState::Detached;
                self.notify_limited(
                    &format!("no-container:{}", self.spec.name),
                    &format!(
                        "❌ Node {}: configured container not found; check the container name and docker.",
                        self.spec.name
                    ),
                )
                .await;
            }
            Sentinel::NoDocker => {
                self.state = NodeState::Detached;
                self.notify_limited(
                    &format!("no-docker:{}", self.spec.name),
                    &format!("⚠️ Node {}: docker is not installed or not in PATH.", self.spec.name),
                )
                .await;
            }
            Sentinel::NoXrayProcess => {
                self.notify_limited(
                    &format!("no-xray:{}", self.spec.name),
                    &format!(
                        "⚠️ Node {}: xray process not found; the service inside the container may be down.",
                        self.spec.name
                    ),
                )
                .await;
            }
            Sentinel::Unknown => {
                debug!("node={} unrecognized sentinel: {raw}", self.spec.name);
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        self.lines += 1;
        if !line.contains(ACCEPT_TOKEN) || !line.contains(USER_TOKEN) {
            return;
        }
        let Some(parsed) = parser::parse_line(line) else {
            let snippet: String = line.chars().take(200).collect();
            debug!("parse miss node={} line={snippet}", self.spec.name);
            return;
        };
        let Some(limit) = self.ctx.limits.get(&parsed.inbound).copied() else {
            return;
        };
        // fail closed: a source that is not a literal address never reaches
        // the firewall layer
        if parsed.address.parse::<IpAddr>().is_err() {
            debug!(
                "node={} dropping non-address source {:?}",
                self.spec.name, parsed.address
            );
            return;
        }
        self.parsed += 1;

        let (evicted, _was_new) = self
            .ctx
            .store
            .add_address(&parsed.inbound, &parsed.user, &parsed.address, limit)
            .await;
        for old in evicted {
            if old == parsed.address {
                continue;
            }
            self.enforce_eviction(&old, &parsed.user, &parsed.inbound)
                .await;
        }
    }

    async fn enforce_eviction(&mut self, old: &str, user: &str, inbound: &str) {
        let Ok(addr) = old.parse::<IpAddr>() else {
            debug!("node={} evicted entry is not an address: {old:?}", self.spec.name);
            return;
        };
        if self.ctx.store.is_banned_recent(old).await {
            return;
        }

        let was = self.state;
        self.state = NodeState::Abusing;

        let mut success_nodes = Vec::new();
        let mut failed_nodes = Vec::new();
        for node in &self.ctx.all_nodes {
            let ok = match self.ctx.firewall.ensure_rules(node, false).await {
                Ok(()) => self
                    .ctx
                    .firewall
                    .schedule_ban(node, addr, self.ctx.ban_seconds),
                Err(e) => {
                    debug!("ban setup failed node={} ip={old} err={e}", node.name);
                    false
                }
            };
            if ok {
                success_nodes.push(node.name.clone());
            } else {
                failed_nodes.push(node.name.clone());
            }
        }
        warn!(
            "banned ip={old} user={user} inbound={inbound} nodes={}{} for {}m",
            if success_nodes.is_empty() {
                "-".to_string()
            } else {
                success_nodes.join(",")
            },
            if failed_nodes.is_empty() {
                String::new()
            } else {
                format!(" failed={}", failed_nodes.join(","))
            },
            self.ctx.ban_seconds / 60
        );

        if let Err(e) = self.ctx.store.mark_banned(old, self.ctx.ban_seconds).await {
            warn!("mark_banned failed ip={old}: {e}");
        }

        let event = BanEvent {
            address: old.to_string(),
            user: display_user(user).to_string(),
            inbound: inbound.to_string(),
            success_nodes,
            failed_nodes,
        };
        if let Some(batch) = self.batcher.push(event, Instant::now()) {
            self.send_ban_message(batch).await;
        }

        self.state = if was == NodeState::Attached {
            NodeState::Attached
        } else {
            was
        };
    }

    async fn send_ban_message(&self, batch: Vec<BanEvent>) {
        let Some(notifier) = &self.ctx.notifier else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        let minutes = self.ctx.ban_seconds / 60;
        let header = if batch.len() > 1 {
            "🚫 *Banned IPs*"
        } else {
            "🚫 *Banned IP*"
        };
        let mut blocks = vec![header.to_string()];
        for (idx, item) in batch.iter().enumerate() {
            let prefix = if batch.len() > 1 {
                format!("{}. ", idx + 1)
            } else {
                String::new()
            };
            let nodes = if item.success_nodes.is_empty() {
                "-".to_string()
            } else {
                item.success_nodes.join(", ")
            };
            let mut block = format!(
                "{prefix}IP: `{}`\nuser: `{}`\ninbound: `{}`\nnodes: {nodes}\nduration: {minutes} min",
                item.address, item.user, item.inbound
            );
            if !item.failed_nodes.is_empty() {
                block.push_str(&format!("\nfailed nodes: {}", item.failed_nodes.join(", ")));
            }
            blocks.push(block);
        }
        let text = blocks.join("\n\n");

        let result = if batch.len() == 1 {
            notifier
                .send_with_inline(
                    &text,
                    &[vec![(
                        "Unban now".to_string(),
                        format!("unban_now:{}", batch[0].address),
                    )]],
                )
                .await
        } else {
            notifier.send(&text).await
        };
        if let Err(e) = result {
            debug!("ban notification failed: {e}");
        }
    }

    async fn issue_reboot(&self) {
        self.notify(&format!(
            "♻️ Auto-rebooting node {} after no recovery within the 60s grace period.",
            self.spec.name
        ))
        .await;
        let spec = self.spec.clone();
        let notifier = self.ctx.notifier.clone();
        tokio::spawn(async move {
            match ssh::run_status(&spec, REBOOT_CMD).await {
                Ok(0) => {
                    info!("reboot command sent node={}", spec.name);
                    if let Some(n) = notifier {
                        let _ = n
                            .send(&format!(
                                "✅ Reboot command sent to {}; waiting for it to come back.",
                                spec.name
                            ))
                            .await;
                    }
                }
                Ok(rc) => {
                    error!("reboot failed node={} rc={rc}", spec.name);
                    if let Some(n) = notifier {
                        let _ = n
                            .send(&format!(
                                "⚠️ Automatic reboot of {} failed (rc={rc}); please check manually.",
                                spec.name
                            ))
                            .await;
                    }
                }
                Err(e) => {
                    error!("reboot failed node={} err={e}", spec.name);
                    if let Some(n) = notifier {
                        let _ = n
                            .send(&format!("⚠️ Error while auto-rebooting {}: {e}", spec.name))
                            .await;
                    }
                }
            }
        });
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stat.elapsed() >= STATS_INTERVAL {
            debug!(
                "stats node={} lines={} parsed={}",
                self.spec.name, self.lines, self.parsed
            );
            self.last_stat = Instant::now();
            self.lines = 0;
            self.parsed = 0;
        }
    }

    async fn notify(&self, text: &str) {
        if let Some(notifier) = &self.ctx.notifier {
            if let Err(e) = notifier.send(text).await {
                debug!("notify failed: {e}");
            }
        }
    }

    async fn notify_limited(&self, key: &str, text: &str) {
        if self.ctx.notifier.is_some() && self.ctx.limiter.allow(key).await {
            self.notify(text).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sec(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn display_user_strips_numeric_prefix() {
        assert_eq!(display_user("42.alice"), "alice");
        assert_eq!(display_user("alice"), "alice");
        assert_eq!(display_user("a42.bob"), "a42.bob");
        assert_eq!(display_user(".bob"), ".bob");
        assert_eq!(display_user("7.8.carol"), "8.carol");
    }

    #[test]
    fn governor_announces_at_threshold_then_reboots_after_grace() {
        let mut gov = RebootGovernor::new();
        let t0 = Instant::now();
        // ten sentinels within four minutes
        for i in 0..10 {
            let count = gov.record_fd_unreadable(t0 + sec(i * 24));
            assert_eq!(count, i as u32 + 1);
        }
        assert_eq!(gov.decide(t0 + sec(216)), RebootDecision::Announce);
        // still inside the grace period
        gov.record_fd_unreadable(t0 + sec(240));
        assert_eq!(gov.decide(t0 + sec(240)), RebootDecision::Hold);
        // grace elapsed, no prior reboot
        gov.record_fd_unreadable(t0 + sec(280));
        assert_eq!(gov.decide(t0 + sec(280)), RebootDecision::Reboot);
    }

    #[test]
    fn governor_honors_cooldown() {
        let mut gov = RebootGovernor::new();
        let t0 = Instant::now();
        for i in 0..10 {
            gov.record_fd_unreadable(t0 + sec(i));
        }
        assert_eq!(gov.decide(t0 + sec(10)), RebootDecision::Announce);
        gov.record_fd_unreadable(t0 + sec(80));
        assert_eq!(gov.decide(t0 + sec(80)), RebootDecision::Reboot);
        // condition returns shortly after the reboot
        for i in 0..10 {
            gov.record_fd_unreadable(t0 + sec(100 + i));
        }
        assert_eq!(gov.decide(t0 + sec(110)), RebootDecision::Announce);
        gov.record_fd_unreadable(t0 + sec(200));
        assert_eq!(gov.decide(t0 + sec(200)), RebootDecision::CooldownHold);
        // past the 20 minute cooldown the reboot fires again
        for i in 0..10 {
            gov.record_fd_unreadable(t0 + sec(1400 + i));
        }
        assert_eq!(gov.decide(t0 + sec(1410)), RebootDecision::Announce);
        gov.record_fd_unreadable(t0 + sec(1500));
        assert_eq!(gov.decide(t0 + sec(1500)), RebootDecision::Reboot);
    }

    #[test]
    fn governor_window_expiry_resets_count() {
        let mut gov = RebootGovernor::new();
        let t0 = Instant::now();
        for i in 0..9 {
            gov.record_fd_unreadable(t0 + sec(i));
        }
        // the tenth arrives after the 10 minute window lapsed
        assert_eq!(gov.record_fd_unreadable(t0 + sec(700)), 1);
        assert_eq!(gov.decide(t0 + sec(700)), RebootDecision::Hold);
    }

    #[test]
    fn governor_attach_clears_escalation() {
        let mut gov = RebootGovernor::new();
        let t0 = Instant::now();
        for i in 0..10 {
            gov.record_fd_unreadable(t0 + sec(i));
        }
        assert_eq!(gov.decide(t0 + sec(10)), RebootDecision::Announce);
        gov.reset_on_attach(t0 + sec(20));
        gov.record_fd_unreadable(t0 + sec(30));
        assert_eq!(gov.decide(t0 + sec(30)), RebootDecision::Hold);
    }

    fn event(n: u32) -> BanEvent {
        BanEvent {
            address: format!("203.0.113.{n}"),
            user: "alice".into(),
            inbound: "VMESS_TCP".into(),
            success_nodes: vec!["de1".into()],
            failed_nodes: vec![],
        }
    }

    #[test]
    fn batcher_flushes_first_event_immediately() {
        let mut b = BanBatcher::new(sec(5), 10);
        let t0 = Instant::now();
        let flushed = b.push(event(1), t0).unwrap();
        assert_eq!(flushed.len(), 1);
    }

    #[test]
    fn batcher_coalesces_within_window() {
        let mut b = BanBatcher::new(sec(5), 10);
        let t0 = Instant::now();
        assert!(b.push(event(1), t0).is_some());
        assert!(b.push(event(2), t0 + sec(1)).is_none());
        assert!(b.push(event(3), t0 + sec(2)).is_none());
        let flushed = b.push(event(4), t0 + sec(6)).unwrap();
        assert_eq!(flushed.len(), 3);
        // detection order preserved within the message
        assert_eq!(flushed[0].address, "203.0.113.2");
        assert_eq!(flushed[2].address, "203.0.113.4");
    }

    #[test]
    fn batcher_size_cap_forces_flush() {
        let mut b = BanBatcher::new(sec(5), 3);
        let t0 = Instant::now();
        assert!(b.push(event(1), t0).is_some());
        assert!(b.push(event(2), t0).is_none());
        assert!(b.push(event(3), t0).is_none());
        let flushed = b.push(event(4), t0).unwrap();
        assert_eq!(flushed.len(), 3);
    }

    #[test]
    fn batcher_take_if_due_flushes_stragglers() {
        let mut b = BanBatcher::new(sec(5), 10);
        let t0 = Instant::now();
        assert!(b.push(event(1), t0).is_some());
        assert!(b.push(event(2), t0 + sec(1)).is_none());
        assert!(b.take_if_due(t0 + sec(2)).is_none());
        let flushed = b.take_if_due(t0 + sec(6)).unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(b.take_if_due(t0 + sec(20)).is_none());
    }
}
