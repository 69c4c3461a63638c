//! Shared harness: run one algorithm over a simulated topology and
//! capture everything the loop hands to the user handler.
#![allow(dead_code)]

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::Duration;

use hopscan_engine::{
    AlgorithmEvent, AlgorithmOptions, Event, EventLoop, FieldValue, Handler, Lattice,
    LinkDiscovered, NetworkConfig, PingEvent, Probe, Protocol,
};
use hopscan_sim::{SentProbe, SimChannel, SimTopology};

#[derive(Default)]
pub struct Capture {
    pub lattices: Vec<Lattice>,
    pub errors: Vec<String>,
    pub new_links: Vec<LinkDiscovered>,
    pub cap_events: usize,
    pub ping: Vec<PingEvent>,
    pub terminations: usize,
}

/// Run a single instance to completion; returns the capture and the
/// channel's send log.
pub fn run_algorithm(
    topo: SimTopology,
    name: &str,
    options: AlgorithmOptions,
    skeleton: Probe,
    timeout: Duration,
) -> (Capture, Vec<SentProbe>) {
    let channel = SimChannel::new(topo);
    let log = channel.log();

    let capture = Rc::new(RefCell::new(Capture::default()));
    let sink = capture.clone();
    let handler: Handler = Box::new(move |_actions, _id, event| {
        let mut c = sink.borrow_mut();
        match event {
            Event::Algorithm(AlgorithmEvent::MdaNewLink(link)) => c.new_links.push(link.clone()),
            Event::Algorithm(AlgorithmEvent::BranchCapReached { .. }) => c.cap_events += 1,
            Event::Algorithm(AlgorithmEvent::Ping(ping)) => c.ping.push(ping.clone()),
            Event::AlgorithmTerminated(Ok(lattice)) => {
                c.terminations += 1;
                c.lattices.push(lattice.clone());
            }
            Event::AlgorithmTerminated(Err(error)) => {
                c.terminations += 1;
                c.errors.push(error.to_string());
            }
            _ => {}
        }
    });

    let mut event_loop = EventLoop::new(
        channel,
        NetworkConfig {
            timeout,
            verbose: false,
        },
        handler,
    );
    event_loop
        .add_algorithm(name, options, skeleton)
        .expect("algorithm accepted");
    event_loop
        .run(Some(Duration::from_secs(10)))
        .expect("loop ran to completion");
    drop(event_loop);

    let capture = Rc::try_unwrap(capture)
        .unwrap_or_else(|_| panic!("handler still holds the capture"))
        .into_inner();
    let log = log.borrow().clone();
    (capture, log)
}

pub fn ip(a: u8, b: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, a, b))
}

pub fn udp_skeleton(dst: IpAddr) -> Probe {
    let mut probe = Probe::new();
    probe
        .set_protocols(&[Protocol::Ipv4, Protocol::Udp])
        .unwrap();
    probe
        .set_fields([
            ("dst_ip", FieldValue::Address(dst)),
            ("src_port", FieldValue::I16(3083)),
            ("dst_port", FieldValue::I16(30000)),
        ])
        .unwrap();
    probe
}

pub fn icmp_skeleton(dst: IpAddr) -> Probe {
    let mut probe = Probe::new();
    probe
        .set_protocols(&[Protocol::Ipv4, Protocol::IcmpV4])
        .unwrap();
    probe
        .set_fields([
            ("dst_ip", FieldValue::Address(dst)),
            ("icmp_id", FieldValue::I16(7777)),
        ])
        .unwrap();
    probe
}
