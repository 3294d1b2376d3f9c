pub mod backend;
pub mod script;
pub mod worker;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{
    DashMap,
    DashSet,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{
    info,
    warn,
};
use xguard_commons::models::node_model::NodeSpec;

use crate::ssh;

pub use backend::Backend;
pub use worker::{
    PendingBans,
    PENDING_CAP,
};

const ENSURE_TIMEOUT: Duration = Duration::from_secs(60);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(20);
const SINGLE_BAN_TIMEOUT: Duration = Duration::from_secs(20);
const UNBAN_TIMEOUT: Duration = Duration::from_secs(20);
const STATUS_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("no firewall backend on node {0}")]
    BackendAbsent(String),

    #[error("rule ensurance failed on node {node}: {detail}")]
    EnsureFailed { node: String, detail: String },

    #[error("rule verification failed on node {0}")]
    VerifyFailed(String),

    #[error(transparent)]
    Ssh(#[from] ssh::SshError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallStatus {
    pub backend: Backend,
    pub set_v4: bool,
    pub set_v6: bool,
    /// (chain name, rules present) in probe order.
    pub chains: Vec<(String, bool)>,
    pub ensured_cached: bool,
}

impl FirewallStatus {
    pub fn rules_present(&self) -> bool {
        self.chains.iter().any(|(_, present)| *present)
    }

    pub fn healthy(&self) -> bool {
        self.backend != Backend::None && self.set_v4 && self.set_v6 && self.rules_present()
    }
}

/// Parse the `key=value` lines emitted by the status script.
pub fn parse_status_output(output: &str, ensured_cached: bool) -> FirewallStatus {
    let mut status = FirewallStatus {
        backend: Backend::None,
        set_v4: false,
        set_v6: false,
        chains: Vec::new(),
        ensured_cached,
    };
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "backend" => {
                status.backend = match value {
                    "IPTABLES" => Backend::Iptables,
                    "NFT" => Backend::Nftables,
                    _ => Backend::None,
                };
            }
            "set_v4" => status.set_v4 = value == "1",
            "set_v6" => status.set_v6 = value == "1",
            _ => {
                if let Some(chain) = key.strip_prefix("rules_") {
                    status.chains.push((chain.to_string(), value == "1"));
                }
            }
        }
    }
    status
}

/// Fleet-facing firewall enforcer: per-node rule ensurance with verification,
/// per-node batching workers, and the single-shot ban/unban/status calls.
pub struct FirewallEnforcer {
    queues: DashMap<String, Arc<PendingBans>>,
    ensured: DashSet<String>,
    workers_started: DashSet<String>,
}

impl Default for FirewallEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallEnforcer {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            ensured: DashSet::new(),
            workers_started: DashSet::new(),
        }
    }

    fn queue_for(&self, spec: &NodeSpec) -> Arc<PendingBans> {
        self.queues
            .entry(spec.endpoint())
            .or_insert_with(|| Arc::new(PendingBans::new()))
            .clone()
    }

    /// Start the batching worker for a node. Idempotent; called eagerly when
    /// watchers start so the first eviction pays no startup latency.
    pub fn start_worker(&self, spec: &NodeSpec, cancel: CancellationToken) {
        if !self.workers_started.insert(spec.endpoint()) {
            return;
        }
        let queue = self.queue_for(spec);
        worker::spawn_worker(spec.clone(), queue, cancel);
    }

    pub fn is_ensured(&self, spec: &NodeSpec) -> bool {
        self.ensured.contains(&spec.endpoint())
    }

    /// Idempotently install the timed sets and drop rules on a node, then
    /// verify them. Verification failure retries once via remediation
    /// (re-running ensure); nodes that still fail are not cached, so the
    /// next call starts from scratch.
    pub async fn ensure_rules(&self, spec: &NodeSpec, force: bool) -> Result<(), FirewallError> {
        if !force && self.is_ensured(spec) {
            return Ok(());
        }
        let backend = backend::detect_backend(spec).await;
        if backend == Backend::None {
            return Err(FirewallError::BackendAbsent(spec.name.clone()));
        }

        self.run_ensure(spec, backend).await?;
        if !self.run_verify(spec, backend).await? {
            warn!("firewall verify failed node={}, retrying ensure", spec.name);
            self.run_ensure(spec, backend).await?;
            if !self.run_verify(spec, backend).await? {
                return Err(FirewallError::VerifyFailed(spec.name.clone()));
            }
        }
        self.ensured.insert(spec.endpoint());
        info!("ensured firewall on {} backend={backend}", spec.name);
        Ok(())
    }

    async fn run_ensure(&self, spec: &NodeSpec, backend: Backend) -> Result<(), FirewallError> {
        let out = ssh::run_capture(spec, &script::ensure_script(backend), ENSURE_TIMEOUT).await?;
        if !out.success() {
            return Err(FirewallError::EnsureFailed {
                node: spec.name.clone(),
                detail: format!("rc={} {}", out.exit_code, out.output.trim()),
            });
        }
        Ok(())
    }

    async fn run_verify(&self, spec: &NodeSpec, backend: Backend) -> Result<bool, FirewallError> {
        let out = ssh::run_capture(spec, &script::verify_script(backend), VERIFY_TIMEOUT).await?;
        Ok(out.output.contains(script::FIXTURE_SET_V4)
            && out.output.contains(script::FIXTURE_SET_V6)
            && out.output.contains(script::FIXTURE_RULES))
    }

    /// Queue a timed ban for batching on one node. Returns whether the
    /// address was accepted into (or refreshed in) the pending slot.
    pub fn schedule_ban(&self, spec: &NodeSpec, addr: IpAddr, ttl_secs: u64) -> bool {
        self.queue_for(spec).enqueue(addr, ttl_secs)
    }

    pub fn pending_depth(&self, spec: &NodeSpec) -> usize {
        self.queue_for(spec).depth()
    }

    /// Synchronous single-shot ban with membership confirmation.
    pub async fn ban_now(
        &self, spec: &NodeSpec, addr: IpAddr, ttl_secs: u64,
    ) -> Result<bool, FirewallError> {
        let backend = backend::detect_backend(spec).await;
        if backend == Backend::None {
            return Err(FirewallError::BackendAbsent(spec.name.clone()));
        }
        let cmd = script::single_ban_script(backend, &addr, ttl_secs);
        let out = ssh::run_capture(spec, &cmd, SINGLE_BAN_TIMEOUT).await?;
        Ok(out.success() && !out.output.contains(script::MEMBERSHIP_FAIL))
    }

    /// Best-effort removal from the node's set plus a conntrack flush. Safe
    /// on absent sets.
    pub async fn unban(&self, spec: &NodeSpec, addr: IpAddr) -> Result<(), FirewallError> {
        let backend = backend::detect_backend(spec).await;
        let cmd = script::unban_script(backend, &addr);
        let _ = ssh::run_capture(spec, &cmd, UNBAN_TIMEOUT).await?;
        Ok(())
    }

    /// Empty both timed sets on a node (fleet-wide unban-all).
    pub async fn flush_sets(&self, spec: &NodeSpec) -> Result<(), FirewallError> {
        let backend = backend::detect_backend(spec).await;
        let cmd = script::flush_sets_script(backend);
        let _ = ssh::run_capture(spec, &cmd, UNBAN_TIMEOUT).await?;
        Ok(())
    }

    pub async fn status(&self, spec: &NodeSpec) -> Result<FirewallStatus, FirewallError> {
        let out = ssh::run_capture(spec, &script::status_script(), STATUS_TIMEOUT).await?;
        Ok(parse_status_output(&out.output, self.is_ensured(spec)))
    }
}
