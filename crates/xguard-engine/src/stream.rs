use std::time::{
    Duration,
    Instant,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use xguard_commons::models::node_model::NodeSpec;

use crate::shell;
use crate::ssh;

pub const STREAM_PREFIX: &str = "[xguard-stream]";

const RELAUNCH_DELAY: Duration = Duration::from_secs(4);
const BACKOFF_CAP_SECS: u64 = 30;
/// A stream that dies faster than this counts towards the failure streak.
const SHORT_UPTIME: Duration = Duration::from_secs(10);
const RAW_SAMPLE_EVERY: u64 = 20;
const FD_DIAG_MILESTONES: [u32; 3] = [5, 15, 30];
const FD_DIAG_MIN_GAP: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    Attach { container: String },
    FollowPid(u32),
    NoContainer,
    NoDocker,
    NoXrayProcess,
    FdUnreadable,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Sentinel { kind: Sentinel, raw: String },
    Line(String),
    Ended { exit_code: i32 },
}

/// Classify one output line from the remote stream script. Lines without
/// the control prefix are raw proxy log lines.
pub fn classify_sentinel(line: &str) -> Option<Sentinel> {
    let rest = line.strip_prefix(STREAM_PREFIX)?.trim();
    if let Some(container) = rest.strip_prefix("attach container=") {
        return Some(Sentinel::Attach {
            container: container.trim().to_string(),
        });
    }
    if let Some(pid) = rest.strip_prefix("follow pid=") {
        return Some(match pid.trim().parse() {
            Ok(pid) => Sentinel::FollowPid(pid),
            Err(_) => Sentinel::Unknown,
        });
    }
    if rest.starts_with("no_container") {
        return Some(Sentinel::NoContainer);
    }
    if rest.starts_with("no_docker") {
        return Some(Sentinel::NoDocker);
    }
    if rest.starts_with("no_xray_process") {
        return Some(Sentinel::NoXrayProcess);
    }
    if rest.starts_with("fd_unreadable") {
        return Some(Sentinel::FdUnreadable);
    }
    Some(Sentinel::Unknown)
}

/// The remote side of the supervisor: locate the container (falling back to
/// any container whose process list has xray), then follow the proxy's fd 1
/// and 2 through /proc in a retry loop, reporting state through in-band
/// sentinels on stdout.
pub fn stream_script(container: &str) -> String {
    let target = shell::quote(container);
    format!(
        r#"SUDO=""; if [ "$(id -u)" != 0 ]; then if command -v sudo >/dev/null 2>&1; then SUDO="sudo"; fi; fi
if ! command -v docker >/dev/null 2>&1; then echo '{prefix} no_docker'; exit 41; fi
TARGET={target}
if ! $SUDO docker inspect "$TARGET" >/dev/null 2>&1; then
  for c in $($SUDO docker ps --format '{{{{.Names}}}}' 2>/dev/null); do
    if $SUDO docker exec "$c" sh -lc 'command -v pgrep >/dev/null 2>&1 && pgrep -xo xray >/dev/null 2>&1 || ps | grep -i xray | grep -v grep >/dev/null 2>&1'; then TARGET="$c"; break; fi
  done
fi
if ! $SUDO docker inspect "$TARGET" >/dev/null 2>&1; then echo '{prefix} no_container'; exit 42; fi
echo '{prefix} attach container='$TARGET
exec $SUDO docker exec -i "$TARGET" sh -c '
if ! command -v pgrep >/dev/null 2>&1; then (apk add --no-cache procps 2>/dev/null || (apt-get update -y >/dev/null 2>&1 && apt-get install -y procps >/dev/null 2>&1) || yum install -y procps-ng >/dev/null 2>&1 || true); fi;
while true; do
  if command -v pgrep >/dev/null 2>&1; then pid=$(pgrep -xo xray); else pid=$(ps | grep -i xray | grep -v grep | awk "{{print \$1; exit}}"); fi;
  if [ -z "$pid" ]; then echo "{prefix} no_xray_process"; sleep 2; continue; fi;
  if [ ! -r /proc/$pid/fd/1 ]; then echo "{prefix} fd_unreadable pid=$pid"; sleep 2; continue; fi;
  echo "{prefix} follow pid=$pid";
  cat /proc/$pid/fd/1 /proc/$pid/fd/2 2>/dev/null || true;
  sleep 1;
done'"#,
        prefix = STREAM_PREFIX,
        target = target,
    )
}

fn fd_diag_script() -> &'static str {
    r#"pid=$(pgrep -xo xray || ps | grep -i xray | grep -v grep | awk '{print $1;exit}'); if [ -n "$pid" ]; then echo '[xguard-diag] ls_fd:'; ls -l /proc/$pid/fd 2>/dev/null | head -20; echo '[xguard-diag] stat_fd1:'; stat /proc/$pid/fd/1 2>/dev/null || true; fi"#
}

/// Spawn the per-node log-stream supervisor. It runs until the token is
/// cancelled or the receiver is dropped, reattaching across process and
/// container restarts.
pub fn spawn_supervisor(
    spec: NodeSpec, cancel: CancellationToken,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        supervise(spec, tx, cancel).await;
    });
    rx
}

async fn supervise(spec: NodeSpec, tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) {
    let mut failure_streak: u32 = 0;
    let mut fd_unreadable_count: u32 = 0;
    let mut last_diag: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            return;
        }
        if failure_streak > 0 {
            if let Err(e) = ssh::probe_connectivity(&spec).await {
                failure_streak += 1;
                debug!("connectivity probe failed node={} kind={e}", spec.name);
                let backoff =
                    Duration::from_secs(BACKOFF_CAP_SECS.min(2 * failure_streak as u64));
                if sleep_or_cancel(backoff, &cancel).await {
                    return;
                }
                continue;
            }
            ssh::diagnose_docker(&spec).await;
        }

        let script = stream_script(&spec.docker_container);
        let remote = format!("sh -lc {}", shell::quote(&script));
        debug!("starting log stream node={}", spec.name);
        let (mut child, mut lines) = match ssh::spawn_stream(&spec, &remote) {
            Ok(pair) => pair,
            Err(e) => {
                failure_streak += 1;
                error!("spawn ssh failed node={} err={e}", spec.name);
                let backoff =
                    Duration::from_secs(BACKOFF_CAP_SECS.min(2 * failure_streak as u64));
                if sleep_or_cancel(backoff, &cancel).await {
                    return;
                }
                continue;
            }
        };

        let start = Instant::now();
        let mut raw_count: u64 = 0;
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    return;
                }
                line = lines.recv() => line,
            };
            let Some(line) = line else {
                break;
            };

            match classify_sentinel(&line) {
                Some(kind) => {
                    match kind {
                        Sentinel::FdUnreadable => {
                            fd_unreadable_count += 1;
                            if FD_DIAG_MILESTONES.contains(&fd_unreadable_count)
                                && last_diag.is_none_or(|t| t.elapsed() > FD_DIAG_MIN_GAP)
                            {
                                last_diag = Some(Instant::now());
                                run_fd_diagnostics(&spec).await;
                            }
                        }
                        Sentinel::FollowPid(_) => {
                            fd_unreadable_count = 0;
                        }
                        _ => {}
                    }
                    info!(
                        "node={} {}",
                        spec.name,
                        line.trim_start_matches(STREAM_PREFIX).trim()
                    );
                    if tx
                        .send(StreamEvent::Sentinel { kind, raw: line })
                        .await
                        .is_err()
                    {
                        let _ = child.start_kill();
                        return;
                    }
                }
                None => {
                    // Client-side ssh errors surface as raw lines; catch a
                    // rotated host key here too and restart fast.
                    if ssh::hostkey::rotation_detected(&line)
                        && !ssh::hostkey::already_cleared(&spec.host)
                    {
                        let fingerprint = ssh::hostkey::extract_fingerprint(&line);
                        warn!(
                            "hostkey rotated node={} host={} fingerprint={} action=detected(stream)",
                            spec.name, spec.host, fingerprint
                        );
                        let removed = ssh::hostkey::clear_known_host(&spec.host).await;
                        ssh::hostkey::mark_cleared(&spec.host);
                        if removed {
                            info!(
                                "hostkey rotated node={} host={} action=auto-cleared(stream) status=will-retry",
                                spec.name, spec.host
                            );
                            break;
                        }
                        error!(
                            "hostkey rotated node={} host={} action=remove_failed(stream)",
                            spec.name, spec.host
                        );
                    }
                    raw_count += 1;
                    if raw_count % RAW_SAMPLE_EVERY == 0 {
                        debug!("node={} raw-log(sampled): {}", spec.name, line);
                    }
                    if tx.send(StreamEvent::Line(line)).await.is_err() {
                        let _ = child.start_kill();
                        return;
                    }
                }
            }
        }

        let _ = child.start_kill();
        let exit_code = child
            .wait()
            .await
            .map(|s| s.code().unwrap_or(-1))
            .unwrap_or(-1);
        let uptime = start.elapsed();
        if exit_code != 0 {
            failure_streak = if uptime < SHORT_UPTIME {
                failure_streak + 1
            } else {
                0
            };
            if ssh::is_auth_failure(exit_code) {
                error!(
                    "ssh session ended rc={} node={} uptime={:.1}s (auth/network)",
                    exit_code,
                    spec.name,
                    uptime.as_secs_f64()
                );
            } else {
                warn!(
                    "log stream wrapper ended node={} rc={} uptime={:.1}s",
                    spec.name,
                    exit_code,
                    uptime.as_secs_f64()
                );
            }
        } else {
            failure_streak = 0;
        }
        if tx.send(StreamEvent::Ended { exit_code }).await.is_err() {
            return;
        }
        if sleep_or_cancel(RELAUNCH_DELAY, &cancel).await {
            return;
        }
    }
}

async fn run_fd_diagnostics(spec: &NodeSpec) {
    match ssh::run_capture(spec, fd_diag_script(), Duration::from_secs(8)).await {
        Ok(out) => {
            warn!(
                "node={} fd_unreadable diagnostics rc={} out={}",
                spec.name,
                out.exit_code,
                out.output.trim()
            );
        }
        Err(e) => {
            warn!("node={} fd_unreadable diagnostics failed: {e}", spec.name);
        }
    }
}

/// Returns true when cancelled.
async fn sleep_or_cancel(dur: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(dur) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_all_sentinels() {
        assert_eq!(
            classify_sentinel("[xguard-stream] attach container=marzban-node"),
            Some(Sentinel::Attach {
                container: "marzban-node".into()
            })
        );
        assert_eq!(
            classify_sentinel("[xguard-stream] follow pid=217"),
            Some(Sentinel::FollowPid(217))
        );
        assert_eq!(
            classify_sentinel("[xguard-stream] no_container"),
            Some(Sentinel::NoContainer)
        );
        assert_eq!(
            classify_sentinel("[xguard-stream] no_docker"),
            Some(Sentinel::NoDocker)
        );
        assert_eq!(
            classify_sentinel("[xguard-stream] no_xray_process"),
            Some(Sentinel::NoXrayProcess)
        );
        assert_eq!(
            classify_sentinel("[xguard-stream] fd_unreadable pid=217"),
            Some(Sentinel::FdUnreadable)
        );
        assert_eq!(
            classify_sentinel("[xguard-stream] something_new"),
            Some(Sentinel::Unknown)
        );
    }

    #[test]
    fn raw_lines_are_not_sentinels() {
        assert_eq!(
            classify_sentinel("from tcp:1.2.3.4:5 accepted tcp:x:1 [I] email: u"),
            None
        );
        assert_eq!(classify_sentinel(""), None);
    }

    #[test]
    fn script_embeds_container_and_sentinels() {
        let script = stream_script("marzban-node");
        assert!(script.contains("TARGET=marzban-node"));
        assert!(script.contains("[xguard-stream] no_docker"));
        assert!(script.contains("[xguard-stream] no_container"));
        assert!(script.contains("no_xray_process"));
        assert!(script.contains("fd_unreadable pid=$pid"));
        assert!(script.contains("follow pid=$pid"));
        assert!(script.contains("/proc/$pid/fd/1"));
        assert!(script.contains("docker ps --format '{{.Names}}'"));
    }

    #[test]
    fn script_quotes_hostile_container_names() {
        let script = stream_script("evil; rm -rf /");
        assert!(script.contains("TARGET='evil; rm -rf /'"));
    }
}
