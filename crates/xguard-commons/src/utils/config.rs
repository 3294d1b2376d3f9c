use std::path::Path;

use tracing::info;

use crate::error::ConfigError;
use crate::models::config_model::GuardianConfig;

/// Load and validate the guardian configuration. Validation failures are
/// fatal to bootstrap, so errors carry enough detail to fix the file.
pub fn load_config(path: &Path) -> Result<GuardianConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let cfg: GuardianConfig = serde_yaml::from_str(&raw)?;
    validate_config(&cfg)?;
    info!(
        "config loaded: nodes={} ban_minutes={} limited_inbounds={}",
        cfg.nodes.len(),
        cfg.ban_minutes,
        cfg.inbounds_limit.len()
    );
    Ok(cfg)
}

pub fn validate_config(cfg: &GuardianConfig) -> Result<(), ConfigError> {
    if cfg.ban_minutes == 0 {
        return Err(ConfigError::Invalid("ban_minutes must be positive".into()));
    }
    for (inbound, limit) in &cfg.inbounds_limit {
        if *limit == 0 {
            return Err(ConfigError::Invalid(format!(
                "inbound '{inbound}' has zero limit; remove it instead"
            )));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for node in &cfg.nodes {
        if node.name.is_empty() || node.host.is_empty() {
            return Err(ConfigError::Invalid(
                "node name and host are required".into(),
            ));
        }
        if !seen.insert(node.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate node name '{}'",
                node.name
            )));
        }
        match (&node.ssh_key, &node.ssh_pass) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' sets both ssh_key and ssh_pass",
                    node.name
                )));
            }
            (None, None) => {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' needs ssh_key or ssh_pass",
                    node.name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::models::node_model::NodeSpec;

    fn node(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            host: "198.51.100.10".into(),
            ssh_user: "root".into(),
            ssh_port: 22,
            docker_container: "marzban-node".into(),
            ssh_key: Some("/root/.ssh/id_rsa".into()),
            ssh_pass: None,
        }
    }

    #[test]
    fn load_round_trip_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "ban_minutes: 15\ninbounds_limit:\n  VMESS_TCP: 1\nnodes:\n  - name: de1\n    host: 198.51.100.10\n    ssh_key: /root/.ssh/id_rsa\n"
        )
        .unwrap();
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.ban_minutes, 15);
        assert_eq!(cfg.ban_seconds(), 900);
        assert_eq!(cfg.nodes.len(), 1);
    }

    #[test]
    fn rejects_node_without_auth() {
        let mut cfg = GuardianConfig::default();
        let mut n = node("de1");
        n.ssh_key = None;
        cfg.nodes.push(n);
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_node_with_both_auth_methods() {
        let mut cfg = GuardianConfig::default();
        let mut n = node("de1");
        n.ssh_pass = Some("hunter2".into());
        cfg.nodes.push(n);
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let mut cfg = GuardianConfig::default();
        cfg.nodes.push(node("de1"));
        cfg.nodes.push(node("de1"));
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_limits() {
        let mut cfg = GuardianConfig::default();
        cfg.inbounds_limit.insert("VMESS_TCP".into(), 0);
        assert!(validate_config(&cfg).is_err());
    }
}
