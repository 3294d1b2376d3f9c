use std::time::Duration;

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::{
    info,
    warn,
};
use xguard_commons::models::node_model::NodeSpec;

use crate::ssh;

use super::script;

const DETECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Iptables,
    Nftables,
    None,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Iptables => "iptables",
            Backend::Nftables => "nftables",
            Backend::None => "none",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static! {
    // One probe per node per process lifetime.
    static ref BACKEND_CACHE: DashMap<String, Backend> = DashMap::new();
}

/// Maps the probe script's echoed token. Unknown output means the probe ran
/// on a host with neither toolchain.
pub fn parse_backend_output(output: &str) -> Backend {
    match output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
    {
        "IPTABLES" => Backend::Iptables,
        "NFT" => Backend::Nftables,
        _ => Backend::None,
    }
}

/// Cached probe result, if the node has been probed successfully.
pub fn cached_backend(spec: &NodeSpec) -> Option<Backend> {
    BACKEND_CACHE.get(&spec.endpoint()).map(|b| *b)
}

/// Probe which firewall toolchain the node carries, cached for the process
/// lifetime. Probe failures are not cached so a transient ssh error does not
/// pin a node to `none`.
pub async fn detect_backend(spec: &NodeSpec) -> Backend {
    if let Some(cached) = BACKEND_CACHE.get(&spec.endpoint()) {
        return *cached;
    }
    let out = match ssh::run_capture(spec, &script::detect_backend_script(), DETECT_TIMEOUT).await
    {
        Ok(out) => out,
        Err(e) => {
            warn!("backend probe failed node={} err={e}", spec.name);
            return Backend::None;
        }
    };
    if !out.success() {
        warn!(
            "backend probe failed node={} rc={}",
            spec.name, out.exit_code
        );
        return Backend::None;
    }
    let backend = parse_backend_output(&out.output);
    info!("node={} firewall backend={backend}", spec.name);
    BACKEND_CACHE.insert(spec.endpoint(), backend);
    backend
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_tokens() {
        assert_eq!(parse_backend_output("IPTABLES\n"), Backend::Iptables);
        assert_eq!(parse_backend_output("NFT\n"), Backend::Nftables);
        assert_eq!(parse_backend_output("NONE\n"), Backend::None);
        assert_eq!(parse_backend_output(""), Backend::None);
        // noise before the token (motd, warnings) is ignored
        assert_eq!(
            parse_backend_output("Warning: something\nIPTABLES\n"),
            Backend::Iptables
        );
    }
}
