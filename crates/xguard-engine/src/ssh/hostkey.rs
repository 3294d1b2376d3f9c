use std::path::PathBuf;

use dashmap::DashSet;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

const ROTATION_TOKEN: &str = "IDENTIFICATION HAS CHANGED";

lazy_static! {
    // Hosts whose rotated key we already cleared; one automatic recovery
    // per host per process lifetime, further mismatches surface as failures.
    static ref CLEARED: DashSet<String> = DashSet::new();
    static ref FINGERPRINT_RX: Regex =
        Regex::new(r"SHA256:[A-Za-z0-9+/=]+").expect("fingerprint regex");
}

pub fn rotation_detected(output: &str) -> bool {
    output.contains(ROTATION_TOKEN)
}

pub fn extract_fingerprint(output: &str) -> String {
    FINGERPRINT_RX
        .find(output)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn already_cleared(host: &str) -> bool {
    CLEARED.contains(host)
}

pub fn mark_cleared(host: &str) {
    CLEARED.insert(host.to_string());
}

fn known_hosts_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts"))
}

/// Remove the stale host-key entry so the rotated key is accepted on retry.
/// `ssh-keygen -R` handles hashed and plain entries; a manual scrub covers
/// comma-joined aliases it can miss.
pub async fn clear_known_host(host: &str) -> bool {
    let keygen_ok = match Command::new("ssh-keygen").arg("-R").arg(host).output().await {
        Ok(out) => out.status.success(),
        Err(e) => {
            debug!("ssh-keygen -R failed for {host}: {e}");
            false
        }
    };
    let scrub_ok = scrub_known_hosts_file(host).await;
    keygen_ok || scrub_ok
}

async fn scrub_known_hosts_file(host: &str) -> bool {
    let Some(path) = known_hosts_path() else {
        return false;
    };
    let Ok(contents) = tokio::fs::read_to_string(&path).await else {
        return false;
    };
    let needle = host.to_string();
    let kept: Vec<&str> = contents
        .lines()
        .filter(|line| !line_mentions_host(line, &needle))
        .collect();
    if kept.len() == contents.lines().count() {
        return true;
    }
    let mut data = kept.join("\n");
    if !data.is_empty() {
        data.push('\n');
    }
    tokio::fs::write(&path, data).await.is_ok()
}

/// A known_hosts entry names the host in its first field, possibly as one of
/// several comma-separated aliases.
fn line_mentions_host(line: &str, host: &str) -> bool {
    let Some(first) = line.split_whitespace().next() else {
        return false;
    };
    first
        .split(',')
        .any(|alias| alias == host || alias.strip_prefix('[').is_some_and(|a| {
            a.split(']').next() == Some(host)
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_token_detected() {
        let msg = "@@@ WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED! @@@";
        assert!(rotation_detected(msg));
        assert!(!rotation_detected("Connection refused"));
    }

    #[test]
    fn fingerprint_extraction() {
        let msg = "The fingerprint for the ED25519 key is SHA256:gQ4W9pZn+o8= and it hurts";
        assert_eq!(extract_fingerprint(msg), "SHA256:gQ4W9pZn+o8=");
        assert_eq!(extract_fingerprint("no print here"), "unknown");
    }

    #[test]
    fn cleared_set_is_sticky() {
        assert!(!already_cleared("203.0.113.77"));
        mark_cleared("203.0.113.77");
        assert!(already_cleared("203.0.113.77"));
    }

    #[test]
    fn host_matching_in_known_hosts_lines() {
        assert!(line_mentions_host("198.51.100.10 ssh-ed25519 AAAA", "198.51.100.10"));
        assert!(line_mentions_host(
            "198.51.100.10,alias.example ssh-rsa AAAA",
            "198.51.100.10"
        ));
        assert!(line_mentions_host(
            "[198.51.100.10]:2222 ssh-rsa AAAA",
            "198.51.100.10"
        ));
        assert!(!line_mentions_host("198.51.100.11 ssh-rsa AAAA", "198.51.100.10"));
        assert!(!line_mentions_host("", "198.51.100.10"));
    }
}
