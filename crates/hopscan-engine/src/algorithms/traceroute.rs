//! Single-path TTL sweep: classical and Paris modes.
//!
//! Both sweep TTLs from `min_ttl` to `max_ttl`, emitting `num_probes`
//! probes per hop. Paris mode pins the flow identifier so every probe
//! follows one path through per-flow load balancers; classical mode
//! re-rolls the source port per probe, as a kernel-chosen port would.
//! That is the only semantic difference between the two.

use std::net::IpAddr;

use rand::RngExt;

use crate::algorithm::Step;
use crate::error::Result;
use crate::event::Event;
use crate::lattice::{Lattice, NodeId};
use crate::net::PacketIo;
use crate::probe::{FieldValue, Probe, Protocol, Reply};
use crate::runtime::Emit;

/// Ephemeral source-port range used by classical mode.
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

/// Options shared by the single-path sweep and (by embedding) MDA.
#[derive(Debug, Clone)]
pub struct TracerouteOptions {
    /// Starting TTL.
    pub min_ttl: u8,
    /// Maximum TTL to reach.
    pub max_ttl: u8,
    /// Probes emitted per TTL.
    pub num_probes: usize,
    /// Consecutive full-loss TTLs before giving up.
    pub gap_limit: usize,
}

impl Default for TracerouteOptions {
    fn default() -> Self {
        Self {
            min_ttl: 1,
            max_ttl: 30,
            num_probes: 3,
            gap_limit: 3,
        }
    }
}

/// Whether the flow identifier is pinned across the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerouteMode {
    Classic,
    Paris,
}

/// The single-path sweep state machine.
#[derive(Debug)]
pub struct Traceroute {
    opts: TracerouteOptions,
    mode: TracerouteMode,
    skeleton: Probe,
    lattice: Lattice,
    /// Unique interface at the previous TTL; starts at the source
    /// sentinel below `min_ttl`.
    prev: NodeId,
    ttl: u8,
    outstanding: usize,
    /// Nodes observed at the current TTL, in reply order.
    round_nodes: Vec<NodeId>,
    dest_reached: bool,
    /// Consecutive full-loss TTLs.
    gap: usize,
}

impl Traceroute {
    pub(crate) fn new(opts: TracerouteOptions, mode: TracerouteMode, skeleton: Probe) -> Self {
        let mut lattice = Lattice::new();
        let root = lattice.add_interface(opts.min_ttl.saturating_sub(1), None);
        let ttl = opts.min_ttl;
        Self {
            opts,
            mode,
            skeleton,
            lattice,
            prev: root,
            ttl,
            outstanding: 0,
            round_nodes: Vec::new(),
            dest_reached: false,
            gap: 0,
        }
    }

    fn destination(&self) -> Option<IpAddr> {
        self.skeleton.dst_ip()
    }

    pub(crate) fn on_start<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        self.send_round(emit)?;
        Ok(Step::Continue)
    }

    pub(crate) fn on_event<C: PacketIo>(
        &mut self,
        emit: &mut Emit<'_, C>,
        event: Event,
    ) -> Result<Step> {
        match event {
            Event::Reply(reply) | Event::IcmpError(reply) => self.on_reply(emit, reply),
            Event::Timeout { .. } => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.maybe_finish_round(emit)
            }
            _ => Ok(Step::Continue),
        }
    }

    /// Record a reply (or an opaque ICMP-error interface) at its TTL.
    fn on_reply<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>, reply: Reply) -> Result<Step> {
        self.outstanding = self.outstanding.saturating_sub(1);
        let node = self.lattice.add_interface(reply.probe_ttl, Some(reply.from));
        self.lattice.witness(node, reply.probe, Some(reply.rtt));
        if !self.round_nodes.contains(&node) {
            self.round_nodes.push(node);
        }
        if Some(reply.from) == self.destination() {
            self.dest_reached = true;
        }
        self.maybe_finish_round(emit)
    }

    fn maybe_finish_round<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        if self.outstanding > 0 {
            return Ok(Step::Continue);
        }

        if self.round_nodes.is_empty() {
            // Full loss: one `*` sentinel stands for the whole TTL.
            let star = self.lattice.add_interface(self.ttl, None);
            self.lattice.add_link(self.prev, star)?;
            self.prev = star;
            self.gap += 1;
        } else {
            self.gap = 0;
            let nodes = std::mem::take(&mut self.round_nodes);
            for node in &nodes {
                self.lattice.add_link(self.prev, *node)?;
            }
            self.prev = nodes[0];
        }

        if self.dest_reached || self.ttl >= self.opts.max_ttl || self.gap >= self.opts.gap_limit {
            return Ok(Step::Terminated(std::mem::take(&mut self.lattice)));
        }
        self.ttl += 1;
        self.send_round(emit)?;
        Ok(Step::Continue)
    }

    fn send_round<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<()> {
        for _ in 0..self.opts.num_probes {
            let mut probe = self.skeleton.clone();
            probe.set_field("ttl", FieldValue::I8(self.ttl))?;
            self.tag_icmp_seq(&mut probe)?;
            if self.mode == TracerouteMode::Classic {
                self.reroll_flow(&mut probe)?;
            }
            emit.send(&probe)?;
            self.outstanding += 1;
        }
        Ok(())
    }

    /// Echo probes carry the TTL in their sequence number so quoted
    /// headers can recover it.
    fn tag_icmp_seq(&self, probe: &mut Probe) -> Result<()> {
        let has_icmp = probe
            .protocols()
            .any(|p| matches!(p, Protocol::IcmpV4 | Protocol::IcmpV6));
        if has_icmp {
            probe.set_field("icmp_seq", FieldValue::I16(u16::from(self.ttl)))?;
        }
        Ok(())
    }

    /// Classical mode: vary the flow per probe the way a kernel-chosen
    /// source port would.
    fn reroll_flow(&self, probe: &mut Probe) -> Result<()> {
        let mut rng = rand::rng();
        let port = rng.random_range(EPHEMERAL_PORTS);
        let has_ports = probe
            .protocols()
            .any(|p| matches!(p, Protocol::Udp | Protocol::Tcp));
        if has_ports {
            probe.set_field("src_port", FieldValue::I16(port))?;
        } else {
            probe.set_field("icmp_id", FieldValue::I16(port))?;
        }
        Ok(())
    }
}
