//! MDA against per-flow ECMP topologies: branch enumeration, the
//! statistical stopping rule, link streaming, and the branch cap.

mod common;

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use common::{ip, run_algorithm, udp_skeleton};
use hopscan_engine::algorithms::mda::MdaOptions;
use hopscan_engine::algorithms::traceroute::TracerouteOptions;
use hopscan_engine::AlgorithmOptions;
use hopscan_sim::{DestKind, HopBehavior, SimTopology};

fn mda_options(bound: f64, max_branch: usize) -> AlgorithmOptions {
    AlgorithmOptions::Mda(MdaOptions {
        bound,
        max_branch,
        traceroute: TracerouteOptions::default(),
    })
}

/// One router, then an ECMP split into two next hops, then the target.
fn split_topology(dest: IpAddr, a1: IpAddr, a2: IpAddr) -> SimTopology {
    SimTopology::new(dest, DestKind::PortUnreachable)
        .hop(HopBehavior::Router(ip(1, 1)))
        .hop(HopBehavior::Split(vec![a1, a2]))
        .then_dest()
}

#[test]
fn ecmp_split_discovers_both_branches() {
    let dest = ip(9, 9);
    let (a1, a2) = (ip(2, 1), ip(2, 2));
    let (capture, _) = run_algorithm(
        split_topology(dest, a1, a2),
        "mda",
        mda_options(0.05, 5),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    assert_eq!(capture.terminations, 1);
    assert!(capture.errors.is_empty());
    let lattice = &capture.lattices[0];

    let at_ttl2: HashSet<Option<IpAddr>> = lattice
        .layer(2)
        .iter()
        .map(|id| lattice.node(*id).addr)
        .collect();
    assert!(at_ttl2.contains(&Some(a1)), "A1 present at ttl 2");
    assert!(at_ttl2.contains(&Some(a2)), "A2 present at ttl 2");

    // Both edges leave the unique ttl-1 interface.
    let ttl1 = lattice.layer(1);
    assert_eq!(ttl1.len(), 1);
    let succ: HashSet<Option<IpAddr>> = lattice
        .successors(ttl1[0])
        .map(|id| lattice.node(id).addr)
        .collect();
    assert!(succ.contains(&Some(a1)));
    assert!(succ.contains(&Some(a2)));
}

#[test]
fn new_links_are_streamed_as_events() {
    let dest = ip(9, 9);
    let (a1, a2) = (ip(2, 1), ip(2, 2));
    let (capture, _) = run_algorithm(
        split_topology(dest, a1, a2),
        "mda",
        mda_options(0.05, 5),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    let streamed: HashSet<(Option<IpAddr>, Option<IpAddr>)> = capture
        .new_links
        .iter()
        .map(|l| (l.from.addr, l.to.as_ref().map(|t| t.addr).unwrap_or(None)))
        .collect();
    assert!(streamed.contains(&(Some(ip(1, 1)), Some(a1))));
    assert!(streamed.contains(&(Some(ip(1, 1)), Some(a2))));
    assert!(streamed.contains(&(Some(a1), Some(dest))));
    assert!(streamed.contains(&(Some(a2), Some(dest))));
}

#[test]
fn stopping_rule_spends_enough_flows_at_the_branch() {
    let dest = ip(9, 9);
    let (capture, log) = run_algorithm(
        split_topology(dest, ip(2, 1), ip(2, 2)),
        "mda",
        mda_options(0.05, 5),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );
    assert_eq!(capture.terminations, 1);

    // With two next hops confirmed and bound 0.05, the branching point
    // must have tried at least n(2) = 8 distinct flows toward ttl 2.
    let distinct_at_2: HashSet<u16> = log
        .iter()
        .filter(|p| p.ttl == 2)
        .map(|p| p.flow.tweak())
        .collect();
    assert!(
        distinct_at_2.len() >= 8,
        "expected >= 8 distinct flows, got {}",
        distinct_at_2.len()
    );
}

#[test]
fn tighter_bound_spends_more_flows() {
    let dest = ip(9, 9);
    let run = |bound: f64| {
        let (_, log) = run_algorithm(
            split_topology(dest, ip(2, 1), ip(2, 2)),
            "mda",
            mda_options(bound, 5),
            udp_skeleton(dest),
            Duration::from_secs(1),
        );
        log.iter()
            .filter(|p| p.ttl == 2)
            .map(|p| p.flow.tweak())
            .collect::<HashSet<u16>>()
            .len()
    };
    assert!(run(0.01) >= run(0.10));
}

#[test]
fn branch_cap_truncates_discovery_with_a_warning() {
    let dest = ip(9, 9);
    let topo = SimTopology::new(dest, DestKind::PortUnreachable)
        .hop(HopBehavior::Split(vec![ip(2, 1), ip(2, 2)]))
        .then_dest();
    let (capture, _) = run_algorithm(
        topo,
        "mda",
        mda_options(0.05, 0),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    assert_eq!(capture.cap_events, 1, "one BranchCapReached warning");
    assert_eq!(capture.terminations, 1, "still terminates normally");
    let lattice = &capture.lattices[0];
    assert!(
        lattice.layer(2).is_empty(),
        "no recursion past the capped ttl"
    );
}

#[test]
fn wider_split_is_enumerated() {
    let dest = ip(9, 9);
    let branches: Vec<IpAddr> = (1..=4).map(|i| ip(3, i)).collect();
    let topo = SimTopology::new(dest, DestKind::PortUnreachable)
        .hop(HopBehavior::Router(ip(1, 1)))
        .hop(HopBehavior::Split(branches.clone()))
        .then_dest();
    let (capture, _) = run_algorithm(
        topo,
        "mda",
        mda_options(0.05, 5),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    let lattice = &capture.lattices[0];
    let found: HashSet<Option<IpAddr>> = lattice
        .layer(2)
        .iter()
        .map(|id| lattice.node(*id).addr)
        .collect();
    for branch in &branches {
        assert!(found.contains(&Some(*branch)), "missing branch {branch}");
    }
}

#[test]
fn silent_branch_records_a_star_once() {
    // The split hop goes dark: the budget is spent, a single `*` sentinel
    // is recorded under the predecessor, and the run ends.
    let dest = ip(9, 9);
    let topo = SimTopology::new(dest, DestKind::PortUnreachable)
        .hop(HopBehavior::Router(ip(1, 1)))
        .hop(HopBehavior::Silent);
    let (capture, _) = run_algorithm(
        topo,
        "mda",
        mda_options(0.05, 5),
        udp_skeleton(dest),
        Duration::from_millis(20),
    );

    assert_eq!(capture.terminations, 1);
    let lattice = &capture.lattices[0];
    let stars: Vec<_> = lattice
        .layer(2)
        .iter()
        .filter(|id| lattice.node(**id).addr.is_none())
        .collect();
    assert_eq!(stars.len(), 1, "repeated timeouts fuse into one sentinel");
}
