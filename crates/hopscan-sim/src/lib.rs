//! # hopscan-sim
//!
//! Deterministic in-memory topologies behind the engine's [`PacketIo`]
//! seam. A [`SimTopology`] describes per-TTL behavior (single router,
//! per-flow ECMP split, silence, administrative unreachables) and a
//! [`SimChannel`] turns emitted probes into synthesized replies, so whole
//! traceroute runs execute without a socket or privileges.
//!
//! No actual network I/O. Branch selection is a pure function of the
//! flow identifier, so the same flow always traverses the same branch,
//! exactly the property the algorithms rely on.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::trace;

use hopscan_engine::{FlowId, PacketIo, Probe, RawReply, ReplyKind};

/// What a given TTL does with an arriving probe.
#[derive(Debug, Clone)]
pub enum HopBehavior {
    /// One router answers with time exceeded.
    Router(IpAddr),
    /// Per-flow ECMP: the flow identifier picks one of the next hops.
    Split(Vec<IpAddr>),
    /// No reply at this TTL.
    Silent,
    /// Administrative unreachable (net/host/port) from a non-destination
    /// router.
    Unreachable(IpAddr, u8),
}

/// How the destination answers once reached.
#[derive(Debug, Clone, Copy)]
pub enum DestKind {
    /// ICMP port unreachable, the UDP traceroute terminal.
    PortUnreachable,
    /// ICMP echo reply.
    EchoReply,
}

/// A simulated path: per-TTL behaviors, then the destination.
#[derive(Debug, Clone)]
pub struct SimTopology {
    dest: IpAddr,
    dest_kind: DestKind,
    hops: Vec<HopBehavior>,
    /// TTL at which the destination answers; `None` never reaches it.
    dest_at: Option<u8>,
    /// Uniform probe loss probability, applied before routing.
    loss: f64,
}

impl SimTopology {
    pub fn new(dest: IpAddr, dest_kind: DestKind) -> Self {
        Self {
            dest,
            dest_kind,
            hops: Vec::new(),
            dest_at: None,
            loss: 0.0,
        }
    }

    /// Append one intermediate hop.
    pub fn hop(mut self, behavior: HopBehavior) -> Self {
        self.hops.push(behavior);
        self
    }

    /// Place the destination right after the configured hops.
    pub fn then_dest(mut self) -> Self {
        self.dest_at = Some(self.hops.len() as u8 + 1);
        self
    }

    /// Uniform probe loss probability.
    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = loss;
        self
    }

    /// A linear path of routers ending at the destination.
    pub fn linear(dest: IpAddr, dest_kind: DestKind, routers: &[IpAddr]) -> Self {
        let mut topo = Self::new(dest, dest_kind);
        for addr in routers {
            topo = topo.hop(HopBehavior::Router(*addr));
        }
        topo.then_dest()
    }

    pub fn dest(&self) -> IpAddr {
        self.dest
    }

    /// Route a flow at a TTL to the interface that answers, if any.
    fn route(&self, flow: &FlowId, ttl: u8) -> Option<(IpAddr, ReplyKind)> {
        if let Some(dest_at) = self.dest_at {
            if ttl >= dest_at {
                let kind = match self.dest_kind {
                    DestKind::PortUnreachable => ReplyKind::Unreachable(3),
                    DestKind::EchoReply => ReplyKind::EchoReply,
                };
                return Some((self.dest, kind));
            }
        }
        match self.hops.get(usize::from(ttl).checked_sub(1)?)? {
            HopBehavior::Router(addr) => Some((*addr, ReplyKind::TimeExceeded)),
            HopBehavior::Split(addrs) => {
                let pick = flow_key(flow) % addrs.len();
                Some((addrs[pick], ReplyKind::TimeExceeded))
            }
            HopBehavior::Silent => None,
            HopBehavior::Unreachable(addr, code) => Some((*addr, ReplyKind::Unreachable(*code))),
        }
    }
}

/// Stable per-flow key: the same flow identifier always takes the same
/// branch, independent of TTL. Uniformity does not matter here, only
/// per-flow stability, so the varying tweak field serves directly.
fn flow_key(flow: &FlowId) -> usize {
    usize::from(flow.tweak())
}

/// A record of one emitted probe, for assertions.
#[derive(Debug, Clone)]
pub struct SentProbe {
    pub flow: FlowId,
    pub ttl: u8,
}

/// Shared observation log of a [`SimChannel`].
pub type SimLog = Rc<RefCell<Vec<SentProbe>>>;

/// [`PacketIo`] over a [`SimTopology`].
pub struct SimChannel {
    topo: SimTopology,
    inbound: VecDeque<RawReply>,
    rng: StdRng,
    log: SimLog,
}

impl SimChannel {
    pub fn new(topo: SimTopology) -> Self {
        Self::with_seed(topo, 0)
    }

    pub fn with_seed(topo: SimTopology, seed: u64) -> Self {
        Self {
            topo,
            inbound: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// A handle to the send log, usable after the channel moved into a
    /// loop.
    pub fn log(&self) -> SimLog {
        self.log.clone()
    }
}

impl PacketIo for SimChannel {
    fn send_probe(&mut self, probe: &Probe) -> io::Result<()> {
        let flow = probe.flow_id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "probe has no transport layer")
        })?;
        let ttl = probe
            .ttl()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "probe has no ttl"))?;
        self.log.borrow_mut().push(SentProbe {
            flow: flow.clone(),
            ttl,
        });

        if self.topo.loss > 0.0 && self.rng.random::<f64>() < self.topo.loss {
            trace!(ttl, "sim dropped probe");
            return Ok(());
        }
        let Some((from, kind)) = self.topo.route(&flow, ttl) else {
            return Ok(());
        };
        let quoted_ttl = match kind {
            // Echo replies do not quote the original header.
            ReplyKind::EchoReply | ReplyKind::TcpReply => None,
            _ => Some(ttl),
        };
        self.inbound.push_back(RawReply {
            from,
            kind,
            quoted_flow: flow,
            quoted_ttl,
            recv: quanta::Instant::now(),
        });
        Ok(())
    }

    fn poll(&mut self, budget: Duration) -> io::Result<Option<RawReply>> {
        if let Some(reply) = self.inbound.pop_front() {
            return Ok(Some(reply));
        }
        // Nothing queued: burn a slice of the budget so silent topologies
        // do not spin the loop hot.
        if !budget.is_zero() {
            std::thread::sleep(budget.min(Duration::from_millis(1)));
        }
        Ok(None)
    }
}
