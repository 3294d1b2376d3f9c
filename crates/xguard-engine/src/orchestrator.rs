use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{
    error,
    info,
    warn,
};
use xguard_commons::models::config_model::GuardianConfig;
use xguard_commons::models::node_model::NodeSpec;
use xguard_notify::{
    NotifyLimiter,
    TelegramNotifier,
};
use xguard_store::SessionStore;

use crate::firewall::{
    FirewallEnforcer,
    FirewallStatus,
};
use crate::watcher::{
    NodeWatcher,
    WatcherContext,
};

/// Minimum gap between repeats of the same per-node failure message.
const CONDITION_NOTIFY_INTERVAL: Duration = Duration::from_secs(20);

/// Owns the fleet: one watcher and one firewall worker per node, the shared
/// store client, and the control-plane entry points.
pub struct Orchestrator {
    config: GuardianConfig,
    store: Arc<SessionStore>,
    firewall: Arc<FirewallEnforcer>,
    notifier: Option<Arc<TelegramNotifier>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Connect and ping the state store; unreachable at bootstrap is fatal.
    pub async fn new(config: GuardianConfig) -> anyhow::Result<Self> {
        let store = SessionStore::connect(&config.redis.url)
            .await
            .context("state store unreachable")?;
        store.ping().await.context("state store unreachable")?;

        let notifier = config.telegram.as_ref().and_then(|tg| {
            tg.primary_chat().map(|chat| {
                let extra = tg
                    .admins
                    .iter()
                    .filter(|a| a.as_str() != chat)
                    .cloned()
                    .collect();
                Arc::new(TelegramNotifier::new(
                    tg.bot_token.clone(),
                    chat.to_string(),
                    extra,
                ))
            })
        });

        Ok(Self {
            config,
            store: Arc::new(store),
            firewall: Arc::new(FirewallEnforcer::new()),
            notifier,
            cancel: CancellationToken::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.config.nodes
    }

    /// Probe every node's firewall state concurrently.
    pub async fn fleet_firewall_status(
        &self,
    ) -> HashMap<String, Result<FirewallStatus, String>> {
        let probes = self.config.nodes.iter().map(|node| async {
            let status = self
                .firewall
                .status(node)
                .await
                .map_err(|e| e.to_string());
            (node.name.clone(), status)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Re-run set and rule ensurance on every node, bypassing the cache.
    pub async fn force_ensure_fleet(&self) -> HashMap<String, Result<(), String>> {
        let runs = self.config.nodes.iter().map(|node| async {
            let result = self
                .firewall
                .ensure_rules(node, true)
                .await
                .map_err(|e| e.to_string());
            (node.name.clone(), result)
        });
        join_all(runs).await.into_iter().collect()
    }

    /// Clear the recent-ban marker and remove the address from every node's
    /// sets.
    pub async fn unban_fleet(&self, addr: IpAddr) -> HashMap<String, bool> {
        let text = addr.to_string();
        if let Err(e) = self.store.unmark_banned(&text).await {
            warn!("unban: clearing marker for {text} failed: {e}");
        }
        let runs = self.config.nodes.iter().map(|node| async {
            let ok = match self.firewall.unban(node, addr).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("unban {text} failed node={}: {e}", node.name);
                    false
                }
            };
            (node.name.clone(), ok)
        });
        join_all(runs).await.into_iter().collect()
    }

    /// Bulk unban: delete all recent-ban markers and flush the timed sets on
    /// every node. Returns how many markers were cleared.
    pub async fn unban_all(&self) -> anyhow::Result<usize> {
        let cleared = self.store.unmark_all_banned().await?;
        let flushes = self.config.nodes.iter().map(|node| async {
            if let Err(e) = self.firewall.flush_sets(node).await {
                warn!("set flush failed node={}: {e}", node.name);
            }
        });
        join_all(flushes).await;
        info!("unban-all cleared {cleared} markers");
        Ok(cleared)
    }

    async fn startup_probe(&self) -> String {
        let statuses = self.fleet_firewall_status().await;
        let mut lines = Vec::new();
        for node in &self.config.nodes {
            let line = match statuses.get(&node.name) {
                Some(Ok(status)) if status.healthy() => {
                    format!("{}: backend={} rules=ok", node.name, status.backend)
                }
                Some(Ok(status)) => {
                    info!("node={} firewall incomplete, ensuring", node.name);
                    match self.firewall.ensure_rules(node, false).await {
                        Ok(()) => format!(
                            "{}: backend={} rules=installed",
                            node.name, status.backend
                        ),
                        Err(e) => {
                            error!("startup ensure failed node={}: {e}", node.name);
                            format!("{}: firewall setup failed ({e})", node.name)
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("startup probe failed node={}: {e}", node.name);
                    format!("{}: unreachable ({e})", node.name)
                }
                None => format!("{}: no probe result", node.name),
            };
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Run the fleet until a terminating signal. Workers drain nothing on
    /// shutdown; already-applied kernel TTLs keep counting down on their
    /// own, undrained pending bans are dropped.
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.config.nodes.is_empty() {
            anyhow::bail!("no nodes configured");
        }

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.delete_webhook().await {
                warn!("deleteWebhook failed: {e}");
            }
            let _ = notifier.send("🛡 xguard started").await;
        }

        let summary = self.startup_probe().await;
        info!("fleet firewall summary:\n{summary}");
        if let Some(notifier) = &self.notifier {
            let _ = notifier
                .send(&format!("Fleet firewall status:\n{summary}"))
                .await;
        }

        for node in &self.config.nodes {
            self.firewall.start_worker(node, self.cancel.child_token());
        }

        let store = self.store.clone();
        let health_cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = health_cancel.cancelled() => {}
                _ = store.health_loop() => {}
            }
        });

        let ctx = Arc::new(WatcherContext {
            store: self.store.clone(),
            firewall: self.firewall.clone(),
            notifier: self.notifier.clone(),
            limiter: Arc::new(NotifyLimiter::new(CONDITION_NOTIFY_INTERVAL)),
            limits: self.config.inbounds_limit.clone(),
            ban_seconds: self.config.ban_seconds(),
            all_nodes: self.config.nodes.clone(),
        });

        let mut handles = Vec::new();
        for node in &self.config.nodes {
            info!("starting watcher for node={} host={}", node.name, node.host);
            let watcher = NodeWatcher::new(node.clone(), ctx.clone());
            handles.push(tokio::spawn(watcher.run(self.cancel.child_token())));
        }
        info!("started {} node watchers", handles.len());

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = wait_for_signal() => {
                info!("terminating signal received, shutting down");
                self.cancel.cancel();
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{
        signal,
        SignalKind,
    };
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
