//! Single-path sweeps through simulated topologies: classical and Paris
//! traceroute, loss handling, and the gap stopping rule.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{ip, run_algorithm, udp_skeleton};
use hopscan_engine::algorithms::traceroute::TracerouteOptions;
use hopscan_engine::{AlgorithmOptions, FlowId};
use hopscan_sim::{DestKind, HopBehavior, SimTopology};

fn opts(min_ttl: u8, max_ttl: u8) -> AlgorithmOptions {
    AlgorithmOptions::Traceroute(TracerouteOptions {
        min_ttl,
        max_ttl,
        ..TracerouteOptions::default()
    })
}

#[test]
fn loopback_single_hop() {
    // Destination answers at TTL 1; the lattice is one node under the
    // source sentinel.
    let dest = "127.0.0.1".parse().unwrap();
    let topo = SimTopology::linear(dest, DestKind::PortUnreachable, &[]);
    let (capture, _) = run_algorithm(
        topo,
        "traceroute",
        opts(1, 1),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    assert_eq!(capture.terminations, 1);
    let lattice = &capture.lattices[0];
    let layer1 = lattice.layer(1);
    assert_eq!(layer1.len(), 1);
    assert_eq!(lattice.node(layer1[0]).addr, Some(dest));

    // Exactly one link: source sentinel to the destination.
    assert_eq!(lattice.links().len(), 1);
    let link = lattice.links()[0];
    assert_eq!(lattice.node(link.from).addr, None);
    assert_eq!(lattice.node(link.to).addr, Some(dest));
}

#[test]
fn linear_path_is_fully_discovered() {
    let dest = ip(9, 9);
    let routers = [ip(1, 1), ip(1, 2), ip(1, 3)];
    let topo = SimTopology::linear(dest, DestKind::PortUnreachable, &routers);
    let (capture, _) = run_algorithm(
        topo,
        "paris-traceroute",
        opts(1, 30),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    let lattice = &capture.lattices[0];
    for (i, router) in routers.iter().enumerate() {
        let layer = lattice.layer(i as u8 + 1);
        assert_eq!(layer.len(), 1, "one interface per hop");
        assert_eq!(lattice.node(layer[0]).addr, Some(*router));
    }
    assert_eq!(
        lattice.node(lattice.layer(4)[0]).addr,
        Some(dest),
        "destination at ttl 4"
    );
}

#[test]
fn paris_mode_pins_the_flow_identifier() {
    let dest = ip(9, 9);
    let topo = SimTopology::linear(dest, DestKind::PortUnreachable, &[ip(1, 1), ip(1, 2)]);
    let (_, log) = run_algorithm(
        topo,
        "paris-traceroute",
        opts(1, 30),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    let flows: HashSet<&FlowId> = log.iter().map(|p| &p.flow).collect();
    assert_eq!(flows.len(), 1, "one flow identifier across the whole run");
    assert!(log.iter().all(|p| p.flow.tweak() == 3083));
    // Only the TTL varies.
    let ttls: HashSet<u8> = log.iter().map(|p| p.ttl).collect();
    assert!(ttls.len() > 1);
}

#[test]
fn classical_mode_varies_the_source_port() {
    let dest = ip(9, 9);
    let topo = SimTopology::linear(dest, DestKind::PortUnreachable, &[ip(1, 1), ip(1, 2)]);
    let (_, log) = run_algorithm(
        topo,
        "traceroute",
        opts(1, 30),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    let ports: HashSet<u16> = log.iter().map(|p| p.flow.tweak()).collect();
    assert!(
        ports.len() > 1,
        "kernel-style per-probe source ports must vary"
    );
}

#[test]
fn gap_rule_stops_a_silent_tail() {
    // Routers answer through TTL 7; everything beyond is silent. With the
    // default gap limit of 3, the run stops at TTL 10.
    let mut topo = SimTopology::new(ip(9, 9), DestKind::PortUnreachable);
    for i in 1..=7 {
        topo = topo.hop(HopBehavior::Router(ip(2, i)));
    }
    for _ in 8..=15 {
        topo = topo.hop(HopBehavior::Silent);
    }
    let (capture, _) = run_algorithm(
        topo,
        "traceroute",
        opts(1, 15),
        udp_skeleton(ip(9, 9)),
        Duration::from_millis(20),
    );

    assert_eq!(capture.terminations, 1);
    let lattice = &capture.lattices[0];
    for ttl in 1..=7u8 {
        assert_eq!(lattice.layer(ttl).len(), 1);
        assert!(lattice.node(lattice.layer(ttl)[0]).addr.is_some());
    }
    for ttl in 8..=10u8 {
        assert_eq!(lattice.layer(ttl).len(), 1, "sentinel at ttl {ttl}");
        assert!(lattice.node(lattice.layer(ttl)[0]).addr.is_none());
    }
    assert!(lattice.layer(11).is_empty(), "gap rule fired before ttl 11");
}

#[test]
fn administrative_unreachable_is_an_opaque_interface() {
    // A mid-path router answers host-unreachable; it is recorded at its
    // TTL and the run does not treat it as the destination.
    let dest = ip(9, 9);
    let topo = SimTopology::new(dest, DestKind::PortUnreachable)
        .hop(HopBehavior::Unreachable(ip(3, 1), 1))
        .then_dest();
    let (capture, _) = run_algorithm(
        topo,
        "paris-traceroute",
        opts(1, 5),
        udp_skeleton(dest),
        Duration::from_secs(1),
    );

    let lattice = &capture.lattices[0];
    assert_eq!(lattice.node(lattice.layer(1)[0]).addr, Some(ip(3, 1)));
    assert_eq!(
        lattice.node(lattice.layer(2)[0]).addr,
        Some(dest),
        "sweep continued past the unreachable router"
    );
}

#[test]
fn sub_threshold_loss_is_tolerated() {
    let dest = ip(9, 9);
    let topo = SimTopology::linear(dest, DestKind::PortUnreachable, &[ip(1, 1), ip(1, 2)])
        .with_loss(0.2);
    let (capture, _) = run_algorithm(
        topo,
        "paris-traceroute",
        opts(1, 30),
        udp_skeleton(dest),
        Duration::from_millis(20),
    );

    // Some probes vanish, the path still resolves end to end.
    assert_eq!(capture.terminations, 1);
    assert!(capture.errors.is_empty());
    let lattice = &capture.lattices[0];
    let found_dest = lattice
        .nodes()
        .any(|(_, iface)| iface.addr == Some(dest));
    assert!(found_dest, "destination reached despite 20% loss");
}

#[test]
fn two_instances_share_one_loop() {
    use hopscan_engine::{Event, EventLoop, Handler, NetworkConfig};
    use hopscan_sim::SimChannel;
    use std::cell::RefCell;
    use std::rc::Rc;

    let dest = ip(9, 9);
    let topo = SimTopology::linear(dest, DestKind::PortUnreachable, &[ip(1, 1)]);
    let terminations = Rc::new(RefCell::new(0));
    let sink = terminations.clone();
    let handler: Handler = Box::new(move |_, _, event| {
        if matches!(event, Event::AlgorithmTerminated(_)) {
            *sink.borrow_mut() += 1;
        }
    });
    let mut event_loop = EventLoop::new(
        SimChannel::new(topo),
        NetworkConfig::default(),
        handler,
    );
    let options = || {
        AlgorithmOptions::Traceroute(TracerouteOptions {
            max_ttl: 5,
            ..TracerouteOptions::default()
        })
    };
    event_loop
        .add_algorithm("paris-traceroute", options(), udp_skeleton(dest))
        .unwrap();
    event_loop
        .add_algorithm("traceroute", options(), udp_skeleton(dest))
        .unwrap();
    event_loop.run(Some(Duration::from_secs(10))).unwrap();

    assert_eq!(*terminations.borrow(), 2, "each instance terminates once");
}
