use std::net::IpAddr;
use std::time::{
    Duration,
    Instant,
};

use xguard_commons::models::node_model::NodeSpec;
use xguard_engine::firewall::{
    FirewallEnforcer,
    PENDING_CAP,
};
use xguard_engine::parser::parse_line;
use xguard_engine::watcher::{
    BanBatcher,
    BanEvent,
};

fn node(name: &str) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        host: format!("198.51.100.{}", name.len()),
        ssh_user: "root".into(),
        ssh_port: 22,
        docker_container: "marzban-node".into(),
        ssh_key: Some("/root/.ssh/id_rsa".into()),
        ssh_pass: None,
    }
}

fn addr(n: u32) -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::from(0x0b00_0000u32 + n))
}

#[test]
fn accept_line_parses_to_raw_user_address_inbound() {
    let parsed = parse_line(
        "from tcp:203.0.113.5:48290 accepted tcp:example.com:443 [VMESS_TCP -> IPv4] email: 42.alice",
    )
    .unwrap();
    // the raw identifier is kept; display trimming is a watcher concern
    assert_eq!(parsed.user, "42.alice");
    assert_eq!(parsed.address, "203.0.113.5");
    assert_eq!(parsed.inbound, "VMESS_TCP");
}

#[tokio::test]
async fn pending_slot_backpressure() {
    let enforcer = FirewallEnforcer::new();
    let de1 = node("de1");
    for i in 0..PENDING_CAP as u32 {
        assert!(enforcer.schedule_ban(&de1, addr(i), 100));
    }
    assert_eq!(enforcer.pending_depth(&de1), PENDING_CAP);

    // a new distinct address is refused at the cap
    let x = addr(PENDING_CAP as u32 + 10);
    assert!(!enforcer.schedule_ban(&de1, x, 600));
    assert_eq!(enforcer.pending_depth(&de1), PENDING_CAP);

    // an already-pending address still gets its TTL raised
    assert!(enforcer.schedule_ban(&de1, addr(3), 600));
    assert_eq!(enforcer.pending_depth(&de1), PENDING_CAP);
}

#[tokio::test]
async fn fleet_fanout_keeps_per_node_slots_independent() {
    let enforcer = FirewallEnforcer::new();
    let fleet = [node("de1"), node("nl1"), node("us1")];
    let evicted = addr(1);
    for spec in &fleet {
        assert!(enforcer.schedule_ban(spec, evicted, 600));
    }
    // exactly once per node, deduplicated within each node
    for spec in &fleet {
        assert!(enforcer.schedule_ban(spec, evicted, 600));
        assert_eq!(enforcer.pending_depth(spec), 1);
    }
}

#[test]
fn burst_of_bans_coalesces_into_single_message() {
    let mut batcher = BanBatcher::new(Duration::from_secs(5), 10);
    let t0 = Instant::now();
    let mk = |n: u32| BanEvent {
        address: format!("203.0.113.{n}"),
        user: "alice".into(),
        inbound: "VMESS_TCP".into(),
        success_nodes: vec!["de1".into(), "nl1".into(), "us1".into()],
        failed_nodes: vec![],
    };
    // first eviction notifies immediately with an inline-unban candidate
    let first = batcher.push(mk(1), t0).unwrap();
    assert_eq!(first.len(), 1);
    // the rest of the burst coalesces
    for n in 2..=5 {
        assert!(batcher.push(mk(n), t0 + Duration::from_millis(n as u64 * 100)).is_none());
    }
    let flushed = batcher.push(mk(6), t0 + Duration::from_secs(6)).unwrap();
    assert_eq!(flushed.len(), 5);
    let addrs: Vec<&str> = flushed.iter().map(|e| e.address.as_str()).collect();
    assert_eq!(
        addrs,
        vec!["203.0.113.2", "203.0.113.3", "203.0.113.4", "203.0.113.5", "203.0.113.6"]
    );
}
