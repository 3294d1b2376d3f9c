pub mod hostkey;

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{
    AsyncBufReadExt,
    AsyncRead,
    BufReader,
};
use tokio::process::{
    Child,
    Command,
};
use tokio::sync::mpsc;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use xguard_commons::models::node_model::NodeSpec;

pub const CONNECT_TIMEOUT_SECS: u64 = 8;
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_SENTINEL: &str = "__XG_OK__";
const AUTH_FAILURE_CODE: i32 = 255;
const STREAM_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh spawn failed: {0}")]
    Spawn(String),

    #[error("ssh command timed out after {0:?}")]
    Timeout(Duration),

    #[error("ssh auth failed (rc=255)")]
    Auth,

    #[error("host key rotated and retry failed")]
    HostKeyRetryFailed,

    #[error("ssh command failed rc={0}")]
    Command(i32),
}

/// The OpenSSH client exits 255 for its own failures; after the host-key
/// retry that means authentication or network, not the remote command.
pub fn is_auth_failure(code: i32) -> bool {
    code == AUTH_FAILURE_CODE
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn auth_failed(&self) -> bool {
        is_auth_failure(self.exit_code)
    }
}

/// Build the ssh argv for a node. A persistent control channel multiplexes
/// every invocation against the same node for 60s of idle, amortizing the
/// handshake. BatchMode is only safe with key auth; the sshpass helper must
/// be allowed to see a password prompt.
pub fn build_ssh_args(spec: &NodeSpec) -> Vec<String> {
    let mut opts: Vec<String> = vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "ServerAliveInterval=30".into(),
        "-o".into(),
        "ServerAliveCountMax=3".into(),
        "-o".into(),
        "ControlMaster=auto".into(),
        "-o".into(),
        "ControlPersist=60s".into(),
        "-o".into(),
        "ControlPath=~/.ssh/cm-%r@%h:%p".into(),
        "-o".into(),
        format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
    ];
    if !spec.uses_password() {
        let mut with_batch: Vec<String> = vec!["-o".into(), "BatchMode=yes".into()];
        with_batch.append(&mut opts);
        opts = with_batch;
    }

    let mut argv: Vec<String> = vec!["ssh".into()];
    if let Some(key) = &spec.ssh_key {
        argv.push("-i".into());
        argv.push(key.clone());
    }
    argv.extend(opts);
    argv.push("-p".into());
    argv.push(spec.ssh_port.to_string());
    argv.push(format!("{}@{}", spec.ssh_user, spec.host));

    if let Some(pass) = &spec.ssh_pass {
        let mut with_pass: Vec<String> = vec!["sshpass".into(), "-p".into(), pass.clone()];
        with_pass.extend(argv);
        argv = with_pass;
    }
    argv
}

fn command_for(argv: &[String]) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd
}

/// Run a remote command, capturing combined stdout+stderr. Non-zero exits
/// are returned in `CommandOutput`, not as errors; callers decide what a
/// failing rc means for them.
pub async fn run_capture(
    spec: &NodeSpec, remote_cmd: &str, timeout: Duration,
) -> Result<CommandOutput, SshError> {
    let mut argv = build_ssh_args(spec);
    argv.push(remote_cmd.to_string());

    let mut child = command_for(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SshError::Spawn(e.to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let result = tokio::time::timeout(timeout, async {
        // Drain both pipes concurrently so neither blocks the child.
        let (out, err) = tokio::join!(collect_lines(stdout), collect_lines(stderr));
        let status = child.wait().await;
        (status, format!("{out}{err}"))
    })
    .await;

    match result {
        Ok((status, output)) => {
            let exit_code = status
                .map(|s| s.code().unwrap_or(-1))
                .unwrap_or(-1);
            Ok(CommandOutput { exit_code, output })
        }
        Err(_) => {
            let _ = child.start_kill();
            Err(SshError::Timeout(timeout))
        }
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut out = String::new();
    let Some(reader) = reader else {
        return out;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Fire-and-forget remote command; returns the exit code only.
pub async fn run_status(spec: &NodeSpec, remote_cmd: &str) -> Result<i32, SshError> {
    let out = run_capture(spec, remote_cmd, DEFAULT_RUN_TIMEOUT).await?;
    Ok(out.exit_code)
}

/// Spawn a long-lived remote command with its stdout and stderr merged into
/// one line channel. The child is returned so the caller can reap it and
/// inspect the exit code; dropping it kills the transport.
pub fn spawn_stream(
    spec: &NodeSpec, remote_cmd: &str,
) -> Result<(Child, mpsc::Receiver<String>), SshError> {
    let mut argv = build_ssh_args(spec);
    argv.push(remote_cmd.to_string());

    let mut child = command_for(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SshError::Spawn(e.to_string()))?;

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(forward_lines(stdout, tx));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx));
    }
    Ok((child, rx))
}

async fn forward_lines<R: AsyncRead + Unpin + Send + 'static>(
    reader: R, tx: mpsc::Sender<String>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            return;
        }
    }
}

/// Basic connectivity probe via an echoed sentinel. Host-key rotation is
/// auto-recovered exactly once per host: the stale known-hosts entry is
/// removed and the probe retried; the retry result is authoritative.
/// Failures come back classified (spawn, timeout, auth, host-key retry,
/// command).
pub async fn probe_connectivity(spec: &NodeSpec) -> Result<(), SshError> {
    let probe = format!("echo {PROBE_SENTINEL}");
    let out = match run_capture(spec, &probe, PROBE_TIMEOUT).await {
        Ok(out) => out,
        Err(e) => {
            error!("ssh probe failed node={} err={e}", spec.name);
            return Err(e);
        }
    };
    if out.success() && out.output.contains(PROBE_SENTINEL) {
        return Ok(());
    }

    if hostkey::rotation_detected(&out.output) && !hostkey::already_cleared(&spec.host) {
        let fingerprint = hostkey::extract_fingerprint(&out.output);
        warn!(
            "hostkey rotated node={} host={} fingerprint={} action=detected",
            spec.name, spec.host, fingerprint
        );
        let removed = hostkey::clear_known_host(&spec.host).await;
        hostkey::mark_cleared(&spec.host);
        if removed {
            match run_capture(spec, &probe, PROBE_TIMEOUT).await {
                Ok(retry) if retry.success() && retry.output.contains(PROBE_SENTINEL) => {
                    info!(
                        "hostkey rotated node={} host={} fingerprint={} action=auto-cleared status=accepted",
                        spec.name, spec.host, fingerprint
                    );
                    return Ok(());
                }
                Ok(retry) => {
                    error!(
                        "hostkey rotated node={} host={} action=auto-cleared status=retry_failed rc={}",
                        spec.name, spec.host, retry.exit_code
                    );
                }
                Err(e) => {
                    error!(
                        "hostkey rotated node={} host={} action=auto-cleared status=retry_failed err={e}",
                        spec.name, spec.host
                    );
                }
            }
        } else {
            error!(
                "hostkey rotated node={} host={} action=remove_failed",
                spec.name, spec.host
            );
        }
        return Err(SshError::HostKeyRetryFailed);
    }

    if out.auth_failed() {
        error!(
            "ssh auth failed node={} rc={} check key/password and port access",
            spec.name, out.exit_code
        );
        return Err(SshError::Auth);
    }

    let snippet: Vec<&str> = out.output.trim().lines().rev().take(8).collect();
    error!(
        "ssh basic check failed node={} rc={} lines={}",
        spec.name,
        out.exit_code,
        if snippet.is_empty() {
            "<empty>".to_string()
        } else {
            snippet.into_iter().rev().collect::<Vec<_>>().join("; ")
        }
    );
    Err(SshError::Command(out.exit_code))
}

/// Secondary diagnosis after a probe succeeds following failures: is docker
/// present, and which containers are running.
pub async fn diagnose_docker(spec: &NodeSpec) {
    let cmd = "command -v docker >/dev/null 2>&1 || echo __NO_DOCKER__; docker ps --format '{{.Names}}' 2>/dev/null | head -20";
    match run_capture(spec, cmd, Duration::from_secs(20)).await {
        Ok(out) if !out.success() => {
            error!(
                "docker check failed node={} rc={} out={}",
                spec.name,
                out.exit_code,
                out.output.trim()
            );
        }
        Ok(out) if out.output.contains("__NO_DOCKER__") => {
            error!("node={} docker not installed", spec.name);
        }
        Ok(out) => {
            debug!(
                "node={} docker containers: {}",
                spec.name,
                out.output.split_whitespace().collect::<Vec<_>>().join(" ")
            );
        }
        Err(e) => {
            error!("docker check failed node={} err={e}", spec.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_spec() -> NodeSpec {
        NodeSpec {
            name: "de1".into(),
            host: "198.51.100.10".into(),
            ssh_user: "root".into(),
            ssh_port: 2222,
            docker_container: "marzban-node".into(),
            ssh_key: Some("/root/.ssh/id_rsa".into()),
            ssh_pass: None,
        }
    }

    #[test]
    fn key_auth_keeps_batch_mode() {
        let argv = build_ssh_args(&key_spec());
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.contains(&"-i".to_string()));
        assert!(argv.contains(&"ControlPersist=60s".to_string()));
        assert!(argv.contains(&format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}")));
        assert_eq!(argv.last().unwrap(), "root@198.51.100.10");
        let p_idx = argv.iter().position(|a| a == "-p").unwrap();
        assert_eq!(argv[p_idx + 1], "2222");
    }

    #[test]
    fn password_auth_uses_sshpass_and_drops_batch_mode() {
        let mut spec = key_spec();
        spec.ssh_key = None;
        spec.ssh_pass = Some("hunter2".into());
        let argv = build_ssh_args(&spec);
        assert_eq!(argv[0], "sshpass");
        assert_eq!(argv[1], "-p");
        assert_eq!(argv[2], "hunter2");
        assert_eq!(argv[3], "ssh");
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn exit_code_classification() {
        let ok = CommandOutput {
            exit_code: 0,
            output: String::new(),
        };
        let auth = CommandOutput {
            exit_code: 255,
            output: String::new(),
        };
        assert!(ok.success());
        assert!(!auth.success());
        assert!(auth.auth_failed());
        assert!(is_auth_failure(255));
        assert!(!is_auth_failure(1));
    }

    #[test]
    fn failure_kinds_render_their_exit_codes() {
        assert_eq!(SshError::Auth.to_string(), "ssh auth failed (rc=255)");
        assert_eq!(SshError::Command(42).to_string(), "ssh command failed rc=42");
        assert_eq!(
            SshError::HostKeyRetryFailed.to_string(),
            "host key rotated and retry failed"
        );
    }
}
