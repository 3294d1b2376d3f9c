use std::net::IpAddr;

use crate::shell::quote;

use super::backend::Backend;

pub const SET_V4: &str = "xguard";
pub const SET_V6: &str = "xguard6";
pub const SET_MAXELEM: u32 = 1_048_576;

pub const FIXTURE_SET_V4: &str = "__SET4_OK__";
pub const FIXTURE_SET_V6: &str = "__SET6_OK__";
pub const FIXTURE_RULES: &str = "__RULES_OK__";
pub const MEMBERSHIP_FAIL: &str = "__TEST_FAIL__";

/// Every remote script runs unprivileged when possible and prefixes
/// privileged commands with sudo when it is available.
pub fn sudo_preamble() -> &'static str {
    r#"SUDO=""; if [ "$(id -u)" != 0 ]; then if command -v sudo >/dev/null 2>&1; then SUDO="sudo"; fi; fi"#
}

/// Echoes IPTABLES, NFT or NONE. iptables (any flavour) wins over nft so a
/// host carrying both keeps its legacy toolchain authoritative.
pub fn detect_backend_script() -> String {
    [
        r#"BACKEND="""#,
        r#"IPT=$(command -v iptables-nft || command -v iptables || command -v iptables-legacy || true)"#,
        r#"if [ -n "$IPT" ]; then BACKEND="IPTABLES"; fi"#,
        r#"if [ -z "$BACKEND" ] && command -v nft >/dev/null 2>&1; then BACKEND="NFT"; fi"#,
        r#"[ -z "$BACKEND" ] && BACKEND="NONE""#,
        r#"echo "$BACKEND""#,
    ]
    .join("\n")
}

pub fn set_for(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => SET_V4,
        IpAddr::V6(_) => SET_V6,
    }
}

/// Best-effort conntrack removal in both directions so established flows do
/// not outlive the drop rule.
pub fn conntrack_flush(addr: &IpAddr) -> String {
    let qip = quote(&addr.to_string());
    format!(
        r#"if command -v conntrack >/dev/null 2>&1; then
conntrack -D -s {qip} >/dev/null 2>&1 || true
conntrack -D -d {qip} >/dev/null 2>&1 || true
fi"#
    )
}

fn iptables_tool_lookup() -> &'static str {
    r#"IPT=$(command -v iptables-nft || command -v iptables || command -v iptables-legacy || true)
IP6T=$(command -v ip6tables-nft || command -v ip6tables || command -v ip6tables-legacy || true)"#
}

fn ensure_iptables() -> String {
    format!(
        r#"( command -v ipset >/dev/null 2>&1 ) || \
  ( $SUDO apt-get update -y >/dev/null 2>&1 && $SUDO apt-get install -y ipset >/dev/null 2>&1 ) || \
  ( $SUDO apk add --no-cache ipset >/dev/null 2>&1 ) || \
  ( $SUDO yum install -y ipset >/dev/null 2>&1 ) || true

{tools}
[ -z "$IPT" ] && exit 0

$SUDO ipset create {SET_V4} hash:ip timeout 0 maxelem {SET_MAXELEM} -exist
$SUDO ipset create {SET_V6} hash:ip family inet6 timeout 0 maxelem {SET_MAXELEM} -exist

add_rules() {{
  T=$1; CH=$2; SET=$3; RJUDP=$4
  $T -C "$CH" -m set --match-set "$SET" src -j DROP 2>/dev/null || $SUDO $T -I "$CH" 1 -m set --match-set "$SET" src -j DROP
  $T -C "$CH" -m set --match-set "$SET" src -p udp -j REJECT --reject-with "$RJUDP" 2>/dev/null || $SUDO $T -I "$CH" 1 -m set --match-set "$SET" src -p udp -j REJECT --reject-with "$RJUDP"
  $T -C "$CH" -m set --match-set "$SET" src -p tcp -j REJECT --reject-with tcp-reset 2>/dev/null || $SUDO $T -I "$CH" 1 -m set --match-set "$SET" src -p tcp -j REJECT --reject-with tcp-reset
}}

if $IPT -S DOCKER-USER >/dev/null 2>&1; then CHAINS="DOCKER-USER"; else CHAINS="INPUT FORWARD"; fi
for CH in $CHAINS; do add_rules "$IPT" "$CH" {SET_V4} icmp-port-unreachable; done
if [ -n "$IP6T" ]; then
  if $IP6T -S DOCKER-USER >/dev/null 2>&1; then CHAINS6="DOCKER-USER"; else CHAINS6="INPUT FORWARD"; fi
  for CH in $CHAINS6; do add_rules "$IP6T" "$CH" {SET_V6} icmp6-port-unreachable; done
fi"#,
        tools = iptables_tool_lookup(),
    )
}

fn ensure_nftables() -> String {
    format!(
        r#"$SUDO nft list table inet filter >/dev/null 2>&1 || $SUDO nft add table inet filter
if ! $SUDO nft list chain inet filter DOCKER-USER >/dev/null 2>&1; then
  $SUDO nft list chain inet filter INPUT >/dev/null 2>&1 || $SUDO nft add chain inet filter INPUT '{{ type filter hook input priority 0; }}'
  $SUDO nft list chain inet filter FORWARD >/dev/null 2>&1 || $SUDO nft add chain inet filter FORWARD '{{ type filter hook forward priority 0; }}'
fi
$SUDO nft list set inet filter {SET_V4} >/dev/null 2>&1 || $SUDO nft add set inet filter {SET_V4} '{{ type ipv4_addr; flags timeout; size {SET_MAXELEM}; }}'
$SUDO nft list set inet filter {SET_V6} >/dev/null 2>&1 || $SUDO nft add set inet filter {SET_V6} '{{ type ipv6_addr; flags timeout; size {SET_MAXELEM}; }}'

if $SUDO nft list chain inet filter DOCKER-USER >/dev/null 2>&1; then NFT_CHAINS="DOCKER-USER"; else NFT_CHAINS="INPUT FORWARD"; fi
for CH in $NFT_CHAINS; do
  $SUDO nft list chain inet filter "$CH" | grep -q '@{SET_V4}' || {{
    $SUDO nft insert rule inet filter "$CH" ip saddr @{SET_V4} drop
    $SUDO nft insert rule inet filter "$CH" ip saddr @{SET_V4} meta l4proto udp reject with icmpx type port-unreachable
    $SUDO nft insert rule inet filter "$CH" ip saddr @{SET_V4} meta l4proto tcp reject with tcp reset
  }}
  $SUDO nft list chain inet filter "$CH" | grep -q '@{SET_V6}' || {{
    $SUDO nft insert rule inet filter "$CH" ip6 saddr @{SET_V6} drop
    $SUDO nft insert rule inet filter "$CH" ip6 saddr @{SET_V6} meta l4proto udp reject with icmpx type port-unreachable
    $SUDO nft insert rule inet filter "$CH" ip6 saddr @{SET_V6} meta l4proto tcp reject with tcp reset
  }}
done"#
    )
}

/// Idempotent set + rule ensurance for one backend. Re-running produces the
/// same final rule set.
pub fn ensure_script(backend: Backend) -> String {
    let body = match backend {
        Backend::Iptables => ensure_iptables(),
        Backend::Nftables => ensure_nftables(),
        Backend::None => "exit 0".to_string(),
    };
    format!("{}\n{}\ntrue", sudo_preamble(), body)
}

/// Lists sets and rules and echoes fixture tokens the client checks for.
pub fn verify_script(backend: Backend) -> String {
    let body = match backend {
        Backend::Iptables => format!(
            r#"{tools}
$SUDO ipset list -n 2>/dev/null | grep -qx {SET_V4} && echo {FIXTURE_SET_V4}
$SUDO ipset list -n 2>/dev/null | grep -qx {SET_V6} && echo {FIXTURE_SET_V6}
for CH in DOCKER-USER INPUT FORWARD; do
  $SUDO $IPT -S "$CH" 2>/dev/null | grep -q 'match-set {SET_V4}' && echo "{FIXTURE_RULES} chain=$CH"
done"#,
            tools = iptables_tool_lookup(),
        ),
        Backend::Nftables => format!(
            r#"$SUDO nft list set inet filter {SET_V4} >/dev/null 2>&1 && echo {FIXTURE_SET_V4}
$SUDO nft list set inet filter {SET_V6} >/dev/null 2>&1 && echo {FIXTURE_SET_V6}
for CH in DOCKER-USER INPUT FORWARD; do
  $SUDO nft list chain inet filter "$CH" 2>/dev/null | grep -q '@{SET_V4}' && echo "{FIXTURE_RULES} chain=$CH"
done"#
        ),
        Backend::None => String::new(),
    };
    format!("{}\n{}\ntrue", sudo_preamble(), body)
}

/// One batched insertion: every pending (address, ttl) lands in the kernel
/// in a single remote invocation, followed by a conntrack flush per address.
pub fn batch_script(backend: Backend, items: &[(IpAddr, u64)]) -> String {
    let mut parts = vec![sudo_preamble().to_string()];
    match backend {
        Backend::Iptables => {
            let mut payload = String::new();
            for (addr, ttl) in items {
                payload.push_str(&format!(
                    "add {} {} timeout {} -exist\n",
                    set_for(addr),
                    addr,
                    ttl
                ));
            }
            parts.push(format!(
                "$SUDO ipset restore <<'XG_EOF'\n{payload}XG_EOF"
            ));
        }
        Backend::Nftables => {
            let mut v4 = Vec::new();
            let mut v6 = Vec::new();
            for (addr, ttl) in items {
                // delete-then-add refreshes the element TTL
                parts.push(format!(
                    "$SUDO nft delete element inet filter {} '{{ {} }}' 2>/dev/null || true",
                    set_for(addr),
                    addr
                ));
                match addr {
                    IpAddr::V4(_) => v4.push(format!("{addr} timeout {ttl}s")),
                    IpAddr::V6(_) => v6.push(format!("{addr} timeout {ttl}s")),
                }
            }
            if !v4.is_empty() {
                parts.push(format!(
                    "$SUDO nft add element inet filter {SET_V4} '{{ {} }}'",
                    v4.join(", ")
                ));
            }
            if !v6.is_empty() {
                parts.push(format!(
                    "$SUDO nft add element inet filter {SET_V6} '{{ {} }}'",
                    v6.join(", ")
                ));
            }
        }
        Backend::None => {
            parts.push("exit 1".to_string());
        }
    }
    for (addr, _) in items {
        parts.push(conntrack_flush(addr));
    }
    parts.push("true".to_string());
    parts.join("\n")
}

/// Single-shot ban with membership confirmation for callers that need a
/// bool instead of batching.
pub fn single_ban_script(backend: Backend, addr: &IpAddr, ttl: u64) -> String {
    let set = set_for(addr);
    let qip = quote(&addr.to_string());
    let add = match backend {
        Backend::Iptables => {
            let family = if addr.is_ipv6() { "family inet6 " } else { "" };
            format!(
                r#"( command -v ipset >/dev/null 2>&1 ) || exit 1
$SUDO ipset create {set} hash:ip {family}timeout 0 maxelem {SET_MAXELEM} -exist
$SUDO ipset add {set} {qip} timeout {ttl} -exist"#
            )
        }
        Backend::Nftables => {
            let ty = if addr.is_ipv6() { "ipv6_addr" } else { "ipv4_addr" };
            format!(
                r#"$SUDO nft list table inet filter >/dev/null 2>&1 || $SUDO nft add table inet filter
$SUDO nft list set inet filter {set} >/dev/null 2>&1 || $SUDO nft add set inet filter {set} '{{ type {ty}; flags timeout; size {SET_MAXELEM}; }}'
$SUDO nft delete element inet filter {set} '{{ {qip} }}' 2>/dev/null || true
$SUDO nft add element inet filter {set} '{{ {qip} timeout {ttl}s }}'"#
            )
        }
        Backend::None => "exit 1".to_string(),
    };
    let test = match backend {
        Backend::Iptables => format!(
            "$SUDO ipset test {set} {qip} >/dev/null 2>&1 || echo '{MEMBERSHIP_FAIL}'"
        ),
        Backend::Nftables => format!(
            "$SUDO nft get element inet filter {set} '{{ {qip} }}' >/dev/null 2>&1 || echo '{MEMBERSHIP_FAIL}'"
        ),
        Backend::None => String::new(),
    };
    format!(
        "{}\n{add}\n{}\n{test}\ntrue",
        sudo_preamble(),
        conntrack_flush(addr)
    )
}

/// Best-effort removal; safe when the set or element is absent.
pub fn unban_script(backend: Backend, addr: &IpAddr) -> String {
    let set = set_for(addr);
    let qip = quote(&addr.to_string());
    let del = match backend {
        Backend::Iptables => format!(
            r#"(command -v ipset >/dev/null 2>&1) || exit 0
$SUDO ipset del {set} {qip} 2>/dev/null || true"#
        ),
        Backend::Nftables => format!(
            "$SUDO nft list set inet filter {set} >/dev/null 2>&1 && $SUDO nft delete element inet filter {set} '{{ {qip} }}' 2>/dev/null || true"
        ),
        Backend::None => "exit 0".to_string(),
    };
    format!(
        "{}\n{del}\n{}\ntrue",
        sudo_preamble(),
        conntrack_flush(addr)
    )
}

/// Empty both sets without destroying them; used by fleet-wide unban-all.
pub fn flush_sets_script(backend: Backend) -> String {
    let body = match backend {
        Backend::Iptables => format!(
            r#"(command -v ipset >/dev/null 2>&1) || exit 0
$SUDO ipset flush {SET_V4} 2>/dev/null || true
$SUDO ipset flush {SET_V6} 2>/dev/null || true"#
        ),
        Backend::Nftables => format!(
            r#"$SUDO nft flush set inet filter {SET_V4} 2>/dev/null || true
$SUDO nft flush set inet filter {SET_V6} 2>/dev/null || true"#
        ),
        Backend::None => "exit 0".to_string(),
    };
    format!("{}\n{body}\ntrue", sudo_preamble())
}

/// Emits `key=value` lines the client parses into a status snapshot.
pub fn status_script() -> String {
    format!(
        r#"{preamble}
{detect}
echo "backend=$BACKEND"
case "$BACKEND" in
  "IPTABLES")
    {tools}
    $SUDO ipset list -n 2>/dev/null | grep -qx {SET_V4} && echo set_v4=1 || echo set_v4=0
    $SUDO ipset list -n 2>/dev/null | grep -qx {SET_V6} && echo set_v6=1 || echo set_v6=0
    for CH in DOCKER-USER INPUT FORWARD; do
      $SUDO $IPT -S "$CH" 2>/dev/null | grep -q 'match-set {SET_V4}' && echo "rules_$CH=1" || echo "rules_$CH=0"
    done
  ;;
  "NFT")
    $SUDO nft list set inet filter {SET_V4} >/dev/null 2>&1 && echo set_v4=1 || echo set_v4=0
    $SUDO nft list set inet filter {SET_V6} >/dev/null 2>&1 && echo set_v6=1 || echo set_v6=0
    for CH in DOCKER-USER INPUT FORWARD; do
      $SUDO nft list chain inet filter "$CH" 2>/dev/null | grep -q '@{SET_V4}' && echo "rules_$CH=1" || echo "rules_$CH=0"
    done
  ;;
esac
true"#,
        preamble = sudo_preamble(),
        detect = detect_backend_script().replace("echo \"$BACKEND\"", ":"),
        tools = iptables_tool_lookup().replace('\n', "\n    "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn set_selection_by_family() {
        assert_eq!(set_for(&v4("203.0.113.5")), SET_V4);
        assert_eq!(set_for(&"2001:db8::1".parse().unwrap()), SET_V6);
    }

    #[test]
    fn ensure_iptables_has_sets_rules_and_chain_preference() {
        let script = ensure_script(Backend::Iptables);
        assert!(script.contains("ipset create xguard hash:ip timeout 0 maxelem 1048576 -exist"));
        assert!(script.contains("ipset create xguard6 hash:ip family inet6 timeout 0 maxelem 1048576 -exist"));
        assert!(script.contains("--reject-with tcp-reset"));
        assert!(script.contains("--reject-with \"$RJUDP\""));
        assert!(script.contains("-j DROP"));
        assert!(script.contains("DOCKER-USER"));
        assert!(script.contains("CHAINS=\"INPUT FORWARD\""));
    }

    #[test]
    fn ensure_nftables_mirrors_structure() {
        let script = ensure_script(Backend::Nftables);
        assert!(script.contains("nft add set inet filter xguard '{ type ipv4_addr; flags timeout; size 1048576; }'"));
        assert!(script.contains("nft add set inet filter xguard6 '{ type ipv6_addr; flags timeout; size 1048576; }'"));
        assert!(script.contains("reject with tcp reset"));
        assert!(script.contains("icmpx type port-unreachable"));
        assert!(script.contains("ip saddr @xguard drop"));
        assert!(script.contains("ip6 saddr @xguard6 drop"));
    }

    #[test]
    fn batch_iptables_uses_restore_payload() {
        let items = vec![(v4("203.0.113.5"), 600), ("2001:db8::1".parse().unwrap(), 300)];
        let script = batch_script(Backend::Iptables, &items);
        assert!(script.contains("ipset restore <<'XG_EOF'"));
        assert!(script.contains("add xguard 203.0.113.5 timeout 600 -exist"));
        assert!(script.contains("add xguard6 2001:db8::1 timeout 300 -exist"));
        // flush both directions for every batched address
        assert!(script.contains("conntrack -D -s 203.0.113.5"));
        assert!(script.contains("conntrack -D -d 203.0.113.5"));
        assert!(script.contains("conntrack -D -s 2001:db8::1"));
    }

    #[test]
    fn batch_nftables_refreshes_ttl_and_joins_elements() {
        let items = vec![(v4("203.0.113.5"), 600), (v4("203.0.113.6"), 120)];
        let script = batch_script(Backend::Nftables, &items);
        assert!(script.contains("nft delete element inet filter xguard '{ 203.0.113.5 }'"));
        assert!(script
            .contains("nft add element inet filter xguard '{ 203.0.113.5 timeout 600s, 203.0.113.6 timeout 120s }'"));
    }

    #[test]
    fn single_ban_tests_membership() {
        let script = single_ban_script(Backend::Iptables, &v4("203.0.113.5"), 600);
        assert!(script.contains("ipset add xguard 203.0.113.5 timeout 600 -exist"));
        assert!(script.contains("ipset test xguard 203.0.113.5"));
        assert!(script.contains(MEMBERSHIP_FAIL));
    }

    #[test]
    fn unban_is_safe_on_absent_sets() {
        let script = unban_script(Backend::Nftables, &v4("203.0.113.5"));
        assert!(script.contains("2>/dev/null || true"));
        assert!(script.contains("delete element inet filter xguard"));
        let script = unban_script(Backend::Iptables, &v4("203.0.113.5"));
        assert!(script.contains("ipset del xguard 203.0.113.5"));
    }

    #[test]
    fn status_script_reports_backend_sets_and_chains() {
        let script = status_script();
        assert!(script.contains("echo \"backend=$BACKEND\""));
        assert!(script.contains("set_v4=1"));
        assert!(script.contains("rules_$CH=1"));
    }

    #[test]
    fn verify_script_echoes_fixtures() {
        let script = verify_script(Backend::Iptables);
        assert!(script.contains(FIXTURE_SET_V4));
        assert!(script.contains(FIXTURE_SET_V6));
        assert!(script.contains(FIXTURE_RULES));
    }
}
