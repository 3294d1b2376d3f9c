use serde::{
    Deserialize,
    Serialize,
};

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_container() -> String {
    "marzban-node".to_string()
}

/// Descriptor of one remote node. Immutable once a watcher starts consuming
/// it; authentication is exactly one of `ssh_key` / `ssh_pass`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_container")]
    pub docker_container: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_pass: Option<String>,
}

impl NodeSpec {
    /// Stable identity of the transport endpoint, used as the cache key for
    /// backend detection and rules-ensured tracking.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.ssh_port)
    }

    pub fn uses_password(&self) -> bool {
        self.ssh_pass.is_some()
    }
}

impl std::fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.ssh_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_on_deserialize() {
        let node: NodeSpec = serde_yaml::from_str("name: de1\nhost: 10.0.0.5\n").unwrap();
        assert_eq!(node.ssh_user, "root");
        assert_eq!(node.ssh_port, 22);
        assert_eq!(node.docker_container, "marzban-node");
        assert!(node.ssh_key.is_none());
        assert!(node.ssh_pass.is_none());
    }

    #[test]
    fn endpoint_is_host_port() {
        let node: NodeSpec =
            serde_yaml::from_str("name: de1\nhost: 10.0.0.5\nssh_port: 2222\n").unwrap();
        assert_eq!(node.endpoint(), "10.0.0.5:2222");
        assert_eq!(node.to_string(), "de1@10.0.0.5:2222");
    }
}
