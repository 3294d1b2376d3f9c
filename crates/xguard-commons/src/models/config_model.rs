use std::collections::HashMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::models::node_model::NodeSpec;

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_ban_minutes() -> u64 {
    10
}

fn default_rejected_threshold() -> u32 {
    8
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub admins: Vec<String>,
}

impl TelegramSettings {
    /// Primary recipient: explicit chat id, falling back to the first admin.
    pub fn primary_chat(&self) -> Option<&str> {
        self.chat_id
            .as_deref()
            .or_else(|| self.admins.first().map(String::as_str))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardianConfig {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default = "default_ban_minutes")]
    pub ban_minutes: u64,
    /// Only inbounds listed here are enforced.
    #[serde(default)]
    pub inbounds_limit: HashMap<String, u32>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramSettings>,
    /// Reserved for rejected/invalid-connection detection.
    #[serde(default = "default_rejected_threshold")]
    pub rejected_threshold: u32,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            ban_minutes: default_ban_minutes(),
            inbounds_limit: HashMap::new(),
            nodes: Vec::new(),
            telegram: None,
            rejected_threshold: default_rejected_threshold(),
        }
    }
}

impl GuardianConfig {
    pub fn ban_seconds(&self) -> u64 {
        self.ban_minutes * 60
    }

    pub fn limit_for(&self, inbound: &str) -> Option<u32> {
        self.inbounds_limit.get(inbound).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: GuardianConfig = serde_yaml::from_str("nodes: []\n").unwrap();
        assert_eq!(cfg.redis.url, "redis://127.0.0.1:6379/0");
        assert_eq!(cfg.ban_minutes, 10);
        assert_eq!(cfg.rejected_threshold, 8);
        assert!(cfg.inbounds_limit.is_empty());
        assert!(cfg.telegram.is_none());
    }

    #[test]
    fn only_listed_inbounds_have_limits() {
        let cfg: GuardianConfig =
            serde_yaml::from_str("inbounds_limit:\n  VMESS_TCP: 2\n").unwrap();
        assert_eq!(cfg.limit_for("VMESS_TCP"), Some(2));
        assert_eq!(cfg.limit_for("VLESS_WS"), None);
    }

    #[test]
    fn telegram_primary_chat_falls_back_to_admins() {
        let tg = TelegramSettings {
            bot_token: "t".into(),
            chat_id: None,
            admins: vec!["123".into(), "456".into()],
        };
        assert_eq!(tg.primary_chat(), Some("123"));
    }
}
