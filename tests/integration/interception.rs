//! Interception rule set tests
//!
//! The rule set is installed into `MemoryFilter`, which refuses the same
//! operations iptables refuses, and the resulting tables are checked by
//! classifying synthetic packets. The last test drives real iptables and is
//! ignored by default.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use proptest::prelude::*;

use zmesh_dataplane::config::Config;
use zmesh_dataplane::error::RuleInstallError;
use zmesh_dataplane::interception::{
    classify, FilterSnapshot, InterceptionController, InterceptionRuleSet, IptablesFilter,
    MemoryFilter, Packet, PacketFilter, RuleSpec, Table, Target, Verdict,
};

const PROXY_UID: u32 = 1337;
const MARK: u32 = 0x1;
const INBOUND_PORT: u16 = 8091;
const OUTBOUND_PORT: u16 = 8090;

fn rule_set() -> InterceptionRuleSet {
    InterceptionRuleSet {
        output_chain: "MESH_OUTPUT".into(),
        prerouting_chain: "MESH_PREROUTING".into(),
        mark_chain: "MESH_MARK".into(),
        pod_cidr: "10.10.0.0/16".parse().unwrap(),
        conntrack_mark: MARK,
        proxy_uid: PROXY_UID,
        inbound_port: INBOUND_PORT,
        outbound_port: OUTBOUND_PORT,
    }
}

fn controller() -> InterceptionController<MemoryFilter> {
    InterceptionController::new(MemoryFilter::new(), rule_set())
}

fn installed() -> FilterSnapshot {
    let ctl = controller();
    ctl.install_all().unwrap();
    ctl.filter().snapshot()
}

fn mesh_addr(host: u16, port: u16) -> SocketAddr {
    let [hi, lo] = host.to_be_bytes();
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 10, hi, lo)), port)
}

// ============================================================================
// Installation lifecycle
// ============================================================================

#[test]
fn test_install_from_default_config() {
    let config = Config::default_config();
    let rules = InterceptionRuleSet::from_config(&config).unwrap();
    assert_eq!(rules.proxy_uid, 1337);
    assert_eq!(rules.inbound_port, config.inbound.port);
    assert_eq!(rules.outbound_port, config.outbound.port);

    let ctl = InterceptionController::new(MemoryFilter::new(), rules);
    ctl.install_all().unwrap();
    assert_eq!(ctl.filter().snapshot().rule_count(), 8);
}

#[test]
fn test_install_twice_keeps_one_copy() {
    let ctl = controller();
    ctl.install_all().unwrap();
    let once = ctl.filter().snapshot();

    ctl.install_baseline().unwrap();
    ctl.install_all().unwrap();
    let twice = ctl.filter().snapshot();

    assert_eq!(once, twice);
    assert_eq!(twice.rules(Table::Nat, "MESH_OUTPUT").len(), 2);
    assert_eq!(twice.rules(Table::Nat, "OUTPUT").len(), 1);
}

#[test]
fn test_capture_without_baseline_is_refused() {
    let ctl = controller();
    let err = ctl.install_inbound_capture().unwrap_err();
    assert!(matches!(
        err,
        RuleInstallError::MissingChain { ref chain, .. } if chain == "MESH_PREROUTING"
    ));
    assert!(ctl.filter().snapshot().user_chains().is_empty());
}

#[test]
fn test_partial_teardown() {
    let ctl = controller();
    ctl.install_all().unwrap();

    ctl.remove_outbound_capture().unwrap();
    let snap = ctl.filter().snapshot();
    assert!(snap.rules(Table::Nat, "MESH_OUTPUT").is_empty());
    assert!(snap.rules(Table::Mangle, "MESH_MARK").is_empty());
    assert_eq!(snap.rules(Table::Nat, "MESH_PREROUTING").len(), 2);

    // Outbound flows now pass untouched, inbound is still captured
    let out = Packet::outbound(mesh_addr(1, 40000), mesh_addr(2, 9000), 1000);
    assert_eq!(classify(&snap, &out).verdict, Verdict::Accept);
    let inb = Packet::inbound(mesh_addr(3, 51000), mesh_addr(1, 8080));
    assert_eq!(classify(&snap, &inb).verdict, Verdict::Redirect(INBOUND_PORT));

    ctl.remove_all().unwrap();
    assert_eq!(ctl.filter().snapshot(), MemoryFilter::new().snapshot());
}

#[test]
fn test_foreign_chains_survive_teardown() {
    let filter = MemoryFilter::new();
    filter.new_chain(Table::Nat, "OTHER").unwrap();
    filter
        .append_unique(
            Table::Nat,
            "OUTPUT",
            &RuleSpec::new(Target::Jump("OTHER".into())),
        )
        .unwrap();

    // Still referenced from OUTPUT
    assert!(filter.delete_chain(Table::Nat, "OTHER").is_err());

    // The mesh controller leaves chains it does not own alone
    let ctl = InterceptionController::new(filter, rule_set());
    ctl.install_all().unwrap();
    ctl.remove_all().unwrap();
    let snap = ctl.filter().snapshot();
    assert!(snap.has_chain(Table::Nat, "OTHER"));
    assert_eq!(snap.rules(Table::Nat, "OUTPUT").len(), 1);
}

// ============================================================================
// Classification properties
// ============================================================================

proptest! {
    #[test]
    fn proxy_owned_dials_are_never_redirected(
        src_host in any::<u16>(),
        dst_host in any::<u16>(),
        sport in 1024u16..,
        dport in 1u16..,
    ) {
        let snap = installed();
        let pkt = Packet::outbound(mesh_addr(src_host, sport), mesh_addr(dst_host, dport), PROXY_UID);
        prop_assert_eq!(classify(&snap, &pkt).verdict, Verdict::Accept);
    }

    #[test]
    fn outbound_listener_traffic_is_never_recaptured(
        dst_host in any::<u16>(),
        dport in 1u16..,
        uid in 0u32..65535,
    ) {
        let snap = installed();
        let pkt = Packet::outbound(mesh_addr(1, OUTBOUND_PORT), mesh_addr(dst_host, dport), uid);
        prop_assert_eq!(classify(&snap, &pkt).verdict, Verdict::Accept);

        let to_listener = Packet::outbound(mesh_addr(1, 40000), mesh_addr(dst_host, OUTBOUND_PORT), uid);
        prop_assert_eq!(classify(&snap, &to_listener).verdict, Verdict::Accept);
    }

    #[test]
    fn app_traffic_in_mesh_goes_to_outbound_listener(
        dst_host in any::<u16>(),
        sport in 1024u16..,
        dport in 1u16..,
        uid in 0u32..65535,
    ) {
        prop_assume!(uid != PROXY_UID);
        prop_assume!(sport != OUTBOUND_PORT && dport != OUTBOUND_PORT);

        let snap = installed();
        let pkt = Packet::outbound(mesh_addr(1, sport), mesh_addr(dst_host, dport), uid);
        let c = classify(&snap, &pkt);
        prop_assert_eq!(c.verdict, Verdict::Redirect(OUTBOUND_PORT));
        prop_assert_eq!(c.conn_mark, MARK);
    }

    #[test]
    fn mesh_to_mesh_flows_skip_inbound_capture(
        src_host in any::<u16>(),
        dport in 1u16..,
    ) {
        prop_assume!(dport != INBOUND_PORT);

        let snap = installed();
        let pkt = Packet::inbound(mesh_addr(src_host, 45000), mesh_addr(1, dport));
        prop_assert_eq!(classify(&snap, &pkt).verdict, Verdict::Redirect(INBOUND_PORT));
        prop_assert_eq!(classify(&snap, &pkt.with_conn_mark(MARK)).verdict, Verdict::Accept);
    }

    #[test]
    fn traffic_outside_the_mesh_is_untouched(
        a in 0u8..=255,
        b in 0u8..=255,
        dport in 1u16..,
    ) {
        prop_assume!(a != 10 || b != 10);

        let snap = installed();
        let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, 1, 1)), dport);
        let c = classify(&snap, &Packet::outbound(mesh_addr(1, 40000), dst, 1000));
        prop_assert_eq!(c.verdict, Verdict::Accept);
        prop_assert_eq!(c.conn_mark, 0);
    }

    #[test]
    fn repeated_install_is_stable(times in 1usize..5) {
        let ctl = controller();
        ctl.install_all().unwrap();
        let first = ctl.filter().snapshot();
        for _ in 0..times {
            ctl.install_all().unwrap();
        }
        prop_assert_eq!(ctl.filter().snapshot(), first);
    }
}

// ============================================================================
// Real packet filter
// ============================================================================

#[test]
#[ignore = "requires root and iptables"]
fn test_iptables_install_and_remove() {
    let mut rules = rule_set();
    rules.output_chain = "ZMESH_TEST_OUT".into();
    rules.prerouting_chain = "ZMESH_TEST_PRE".into();
    rules.mark_chain = "ZMESH_TEST_MARK".into();

    let ctl = InterceptionController::new(IptablesFilter::new(false).unwrap(), rules);
    ctl.install_all().unwrap();
    assert!(ctl
        .filter()
        .chain_exists(Table::Nat, "ZMESH_TEST_OUT")
        .unwrap());

    ctl.install_all().unwrap();
    ctl.remove_all().unwrap();
    assert!(!ctl
        .filter()
        .chain_exists(Table::Nat, "ZMESH_TEST_OUT")
        .unwrap());
}
