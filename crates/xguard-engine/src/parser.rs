use lazy_static::lazy_static;
use regex::Regex;

/// Tokens for the fast-path reject; lines missing either cannot be an
/// accepted-connection record.
pub const ACCEPT_TOKEN: &str = "accepted";
pub const USER_TOKEN: &str = "email:";

lazy_static! {
    // from tcp:203.0.113.5:48290 accepted tcp:example.com:443 [VMESS_TCP -> IPv4] email: 42.alice
    static ref ACCEPT_RX: Regex = Regex::new(
        r"(?i)from\s+(?:tcp:|udp:)?(?:\[(?P<ipv6>[0-9a-fA-F:]+)\]|(?P<ipv4>\d{1,3}(?:\.\d{1,3}){3})):(?P<port>\d+).*?\baccepted\b.*?\[(?P<bracket>[^\]]+)\].*?\bemail:\s*(?P<email>\S+)"
    )
    .expect("accept regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub user: String,
    pub address: String,
    pub inbound: String,
}

/// The bracketed label may carry a transport suffix (`NAME -> IPv4` or
/// `NAME >> tag`); the inbound name is everything before the arrow.
fn inbound_from_label(label: &str) -> String {
    let name = label
        .split("->")
        .next()
        .unwrap_or(label)
        .split(">>")
        .next()
        .unwrap_or(label)
        .trim();
    if name.is_empty() {
        "default".to_string()
    } else {
        name.to_string()
    }
}

/// Extract (user, address, inbound) from one access-log line. Malformed
/// input yields `None`; this function never fails.
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    if !line.contains(ACCEPT_TOKEN) || !line.contains(USER_TOKEN) {
        return None;
    }
    let caps = ACCEPT_RX.captures(line)?;
    let address = caps
        .name("ipv4")
        .or_else(|| caps.name("ipv6"))?
        .as_str()
        .to_string();
    let user = caps.name("email")?.as_str().to_string();
    let inbound = inbound_from_label(caps.name("bracket")?.as_str());
    Some(ParsedLine {
        user,
        address,
        inbound,
    })
}
