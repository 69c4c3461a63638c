//! Multipath Detection Algorithm.
//!
//! At each TTL, MDA decides how many distinct flow identifiers to try
//! before asserting that all next-hop interfaces of a predecessor are
//! discovered with confidence `1 - bound`. State is a set of branching
//! contexts, one per predecessor interface; each context probes the next
//! TTL with flows known to traverse its predecessor.
//!
//! When a TTL holds several predecessors, a fresh flow must first be
//! classified: probed at the predecessors' own TTL to learn which of them
//! it traverses. With a unique predecessor every flow trivially belongs
//! to it and classification is skipped.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use tracing::debug;

use crate::algorithm::Step;
use crate::error::{Error, Result};
use crate::event::{AlgorithmEvent, Event, HopRef, LinkDiscovered};
use crate::lattice::{Lattice, NodeId};
use crate::net::PacketIo;
use crate::probe::{FieldValue, Probe, ProbeId, Protocol, Reply};
use crate::runtime::Emit;

use super::traceroute::TracerouteOptions;

/// Upper bound on classification probes per TTL; a context that cannot
/// obtain flows once this is spent is treated as budget-exhausted.
const MAX_CLASSIFY_PER_TTL: usize = 128;

/// MDA options; embeds the common sweep options as the original does.
#[derive(Debug, Clone)]
pub struct MdaOptions {
    /// Upper bound on the probability of missing a path.
    pub bound: f64,
    /// Maximum branching points encountered before discovery is truncated.
    pub max_branch: usize,
    pub traceroute: TracerouteOptions,
}

impl Default for MdaOptions {
    fn default() -> Self {
        Self {
            bound: 0.05,
            max_branch: 5,
            traceroute: TracerouteOptions::default(),
        }
    }
}

// ─── Stopping rule ───────────────────────────────────────────────────────────

/// Precomputed `n(k, bound)` table, extended on demand.
///
/// `n(k)` is the smallest probe count such that, under uniform hashing
/// over the `k` observed next hops plus one hypothetical hidden one, the
/// probability that every probe misses the hidden interface is at most
/// `bound`:  `(k / (k+1))^n <= bound`.
#[derive(Debug)]
pub(crate) struct NkTable {
    bound: f64,
    table: Vec<usize>,
}

impl NkTable {
    pub(crate) fn new(bound: f64) -> Self {
        Self {
            bound: bound.clamp(1e-9, 1.0),
            table: Vec::new(),
        }
    }

    /// Probes required with `k` next hops observed.
    pub(crate) fn n(&mut self, k: usize) -> usize {
        let k = k.max(1);
        while self.table.len() < k {
            let next = self.table.len() + 1;
            let ratio = next as f64 / (next as f64 + 1.0);
            let n = (self.bound.ln() / ratio.ln()).ceil().max(1.0) as usize;
            self.table.push(n);
        }
        self.table[k - 1]
    }
}

// ─── Branching contexts ──────────────────────────────────────────────────────

/// Per-predecessor accounting at the current TTL.
#[derive(Debug)]
struct Context {
    pred: NodeId,
    /// Flows classified to this predecessor, not yet spent on discovery.
    ready: Vec<u16>,
    /// Distinct-flow probes emitted toward the next TTL.
    sent: usize,
    outstanding: usize,
    /// Distinct next-hop interfaces confirmed so far.
    next_hops: Vec<NodeId>,
    /// `*` recorded once; repeats count toward the budget only.
    starred: bool,
    /// This context diverged (>= 2 next hops) and was counted against
    /// `max_branch`.
    counted_branch: bool,
    /// Classification starvation: treated as budget-exhausted.
    starved: bool,
}

impl Context {
    fn new(pred: NodeId, ready: Vec<u16>) -> Self {
        Self {
            pred,
            ready,
            sent: 0,
            outstanding: 0,
            next_hops: Vec::new(),
            starred: false,
            counted_branch: false,
            starved: false,
        }
    }
}

/// Why a probe is in flight.
#[derive(Debug, Clone, Copy)]
enum Purpose {
    /// Enumerate next hops of context `ctx` at `ttl + 1`.
    Discover { ctx: usize },
    /// Learn which predecessor a fresh flow traverses, at `ttl`.
    Classify,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    purpose: Purpose,
    tweak: u16,
}

// ─── Algorithm ───────────────────────────────────────────────────────────────

/// The multipath enumeration state machine.
#[derive(Debug)]
pub struct Mda {
    opts: MdaOptions,
    skeleton: Probe,
    lattice: Lattice,
    nk: NkTable,
    /// TTL of the current predecessors; probes go out at `ttl + 1`.
    ttl: u8,
    contexts: Vec<Context>,
    /// In-flight probes by id.
    pending: HashMap<ProbeId, Pending>,
    /// Flow tweak -> interface it reached at `ttl + 1`; feeds the next
    /// TTL's ready flows.
    forward_flows: HashMap<u16, NodeId>,
    /// Interfaces that answered with an administrative unreachable; kept
    /// in the lattice, never recursed into.
    dead_ends: HashSet<NodeId>,
    base_tweak: u16,
    minted: u16,
    classify_sent: usize,
    branch_points: usize,
    capped: bool,
    varies_ports: bool,
}

impl Mda {
    pub(crate) fn new(opts: MdaOptions, skeleton: Probe) -> Self {
        let mut lattice = Lattice::new();
        let min_ttl = opts.traceroute.min_ttl;
        let root = lattice.add_interface(min_ttl.saturating_sub(1), None);
        let varies_ports = skeleton
            .protocols()
            .any(|p| matches!(p, Protocol::Udp | Protocol::Tcp));
        let base_tweak = skeleton.flow_id().map_or(0, |f| f.tweak());
        let nk = NkTable::new(opts.bound);
        let ttl = min_ttl.saturating_sub(1);
        Self {
            opts,
            skeleton,
            lattice,
            nk,
            ttl,
            contexts: vec![Context::new(root, Vec::new())],
            pending: HashMap::new(),
            forward_flows: HashMap::new(),
            dead_ends: HashSet::new(),
            base_tweak,
            minted: 0,
            classify_sent: 0,
            branch_points: 0,
            capped: false,
            varies_ports,
        }
    }

    pub(crate) fn on_start<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        if self.skeleton.dst_ip().is_none() {
            return Err(Error::NetworkFatal(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "probe skeleton has no destination address",
            )));
        }
        self.pump(emit)?;
        self.maybe_advance(emit)
    }

    pub(crate) fn on_event<C: PacketIo>(
        &mut self,
        emit: &mut Emit<'_, C>,
        event: Event,
    ) -> Result<Step> {
        match event {
            Event::Reply(reply) => self.resolve(emit, reply.probe, Some(reply), false),
            Event::IcmpError(reply) => self.resolve(emit, reply.probe, Some(reply), true),
            Event::Timeout { probe, .. } => self.resolve(emit, probe, None, false),
            _ => Ok(Step::Continue),
        }
    }

    fn destination(&self) -> IpAddr {
        self.skeleton.dst_ip().expect("checked at start")
    }

    /// Route a resolved probe to its context or to classification.
    fn resolve<C: PacketIo>(
        &mut self,
        emit: &mut Emit<'_, C>,
        probe: ProbeId,
        reply: Option<Reply>,
        opaque: bool,
    ) -> Result<Step> {
        let Some(pending) = self.pending.remove(&probe) else {
            return Ok(Step::Continue);
        };
        match (pending.purpose, reply) {
            (Purpose::Discover { ctx }, Some(reply)) => {
                self.discovery_reply(emit, ctx, pending.tweak, &reply, opaque)?;
            }
            (Purpose::Discover { ctx }, None) => {
                self.discovery_timeout(ctx)?;
            }
            (Purpose::Classify, Some(reply)) => {
                self.classify_reply(pending.tweak, &reply);
            }
            (Purpose::Classify, None) => {
                // Flow lost in classification; pump will mint another.
            }
        }
        self.pump(emit)?;
        self.maybe_advance(emit)
    }

    fn discovery_reply<C: PacketIo>(
        &mut self,
        emit: &mut Emit<'_, C>,
        ctx_idx: usize,
        tweak: u16,
        reply: &Reply,
        opaque: bool,
    ) -> Result<()> {
        let node = self.lattice.add_interface(self.ttl + 1, Some(reply.from));
        self.lattice.witness(node, reply.probe, Some(reply.rtt));
        if opaque {
            self.dead_ends.insert(node);
        }
        self.forward_flows.insert(tweak, node);

        let ctx = &mut self.contexts[ctx_idx];
        ctx.outstanding -= 1;
        let pred = ctx.pred;
        let new_hop = !ctx.next_hops.contains(&node);
        if new_hop {
            ctx.next_hops.push(node);
            if ctx.next_hops.len() == 2 && !ctx.counted_branch {
                ctx.counted_branch = true;
                self.branch_points += 1;
                if self.branch_points > self.opts.max_branch {
                    self.capped = true;
                    debug!(ttl = self.ttl + 1, "branch cap reached");
                    emit.post(AlgorithmEvent::BranchCapReached { ttl: self.ttl + 1 });
                }
            }
        }

        if self.lattice.add_link(pred, node)? {
            emit.post(AlgorithmEvent::MdaNewLink(LinkDiscovered {
                from: self.hop_ref(pred),
                to: Some(self.hop_ref(node)),
            }));
        }
        Ok(())
    }

    fn discovery_timeout(&mut self, ctx_idx: usize) -> Result<()> {
        let ctx = &mut self.contexts[ctx_idx];
        ctx.outstanding -= 1;
        if !ctx.starred {
            ctx.starred = true;
            let pred = ctx.pred;
            let star = self.lattice.add_interface(self.ttl + 1, None);
            self.lattice.add_link(pred, star)?;
        }
        Ok(())
    }

    /// A classification reply assigns the flow to the interface that
    /// answered at the predecessors' TTL, possibly one not seen before,
    /// which then becomes a context of its own.
    fn classify_reply(&mut self, tweak: u16, reply: &Reply) {
        let node = self.lattice.add_interface(self.ttl, Some(reply.from));
        self.lattice.witness(node, reply.probe, Some(reply.rtt));
        if let Some(ctx) = self.contexts.iter_mut().find(|c| c.pred == node) {
            ctx.ready.push(tweak);
            return;
        }
        if reply.from == self.destination() || self.dead_ends.contains(&node) {
            return;
        }
        debug!(ttl = self.ttl, addr = %reply.from, "classification found a new predecessor");
        self.contexts.push(Context::new(node, vec![tweak]));
    }

    /// Mint a fresh flow tweak, distinct from every previous one.
    fn mint(&mut self) -> u16 {
        let tweak = self.base_tweak.wrapping_add(self.minted);
        self.minted = self.minted.wrapping_add(1);
        tweak
    }

    fn threshold(&mut self, ctx_idx: usize) -> usize {
        let k = self.contexts[ctx_idx].next_hops.len();
        self.nk.n(k)
    }

    fn context_done(&mut self, ctx_idx: usize) -> bool {
        let threshold = self.threshold(ctx_idx);
        let ctx = &self.contexts[ctx_idx];
        ctx.starved || ctx.sent >= threshold
    }

    /// Emit probes for every context below its threshold, requesting flow
    /// classification where required.
    fn pump<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<()> {
        if self.capped {
            return Ok(());
        }
        for idx in 0..self.contexts.len() {
            loop {
                if self.capped || self.context_done(idx) {
                    break;
                }
                let single = self.contexts.len() == 1;
                let tweak = {
                    let ctx = &mut self.contexts[idx];
                    match ctx.ready.pop() {
                        Some(t) => Some(t),
                        None if single => None, // minted below, borrow released
                        None => {
                            if self.classify_sent >= MAX_CLASSIFY_PER_TTL {
                                ctx.starved = true;
                            }
                            break;
                        }
                    }
                };
                let tweak = match tweak {
                    Some(t) => t,
                    None => self.mint(),
                };
                let probe = self.build_probe(self.ttl + 1, tweak)?;
                let id = emit.send(&probe)?;
                self.pending.insert(
                    id,
                    Pending {
                        purpose: Purpose::Discover { ctx: idx },
                        tweak,
                    },
                );
                let ctx = &mut self.contexts[idx];
                ctx.sent += 1;
                ctx.outstanding += 1;
            }

            // Starved of classified flows: float one classification probe
            // per pump; its reply re-enters pump.
            let needs_classify = {
                let single = self.contexts.len() == 1;
                !single
                    && !self.capped
                    && !self.context_done(idx)
                    && self.contexts[idx].ready.is_empty()
                    && self.classify_sent < MAX_CLASSIFY_PER_TTL
            };
            if needs_classify {
                let tweak = self.mint();
                let probe = self.build_probe(self.ttl, tweak)?;
                let id = emit.send(&probe)?;
                self.classify_sent += 1;
                self.pending.insert(
                    id,
                    Pending {
                        purpose: Purpose::Classify,
                        tweak,
                    },
                );
            }
        }
        Ok(())
    }

    /// Advance to the next TTL once every context settled, or terminate.
    fn maybe_advance<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        if !self.pending.is_empty() {
            return Ok(Step::Continue);
        }
        for idx in 0..self.contexts.len() {
            if !self.capped && !self.context_done(idx) {
                return Ok(Step::Continue);
            }
        }
        if self.capped {
            return Ok(Step::Terminated(std::mem::take(&mut self.lattice)));
        }

        let dest = self.destination();
        let next_ttl = self.ttl + 1;
        let flows = std::mem::take(&mut self.forward_flows);
        let next_preds: Vec<NodeId> = self
            .lattice
            .layer(next_ttl)
            .iter()
            .copied()
            .filter(|id| {
                let iface = self.lattice.node(*id);
                iface.addr.is_some()
                    && iface.addr != Some(dest)
                    && !self.dead_ends.contains(id)
            })
            .collect();

        if next_preds.is_empty() || next_ttl >= self.opts.traceroute.max_ttl {
            return Ok(Step::Terminated(std::mem::take(&mut self.lattice)));
        }

        self.contexts = next_preds
            .into_iter()
            .map(|pred| {
                let ready: Vec<u16> = flows
                    .iter()
                    .filter(|(_, node)| **node == pred)
                    .map(|(tweak, _)| *tweak)
                    .collect();
                Context::new(pred, ready)
            })
            .collect();
        self.ttl = next_ttl;
        self.classify_sent = 0;
        debug!(ttl = self.ttl, contexts = self.contexts.len(), "mda advanced");

        self.pump(emit)?;
        self.maybe_advance(emit)
    }

    /// Clone the skeleton at `ttl` with the flow tweak applied.
    fn build_probe(&self, ttl: u8, tweak: u16) -> Result<Probe> {
        let mut probe = self.skeleton.clone();
        probe.set_field("ttl", FieldValue::I8(ttl))?;
        if self.varies_ports {
            probe.set_field("src_port", FieldValue::I16(tweak))?;
        } else {
            probe.set_field("icmp_id", FieldValue::I16(tweak))?;
            probe.set_field("icmp_seq", FieldValue::I16(u16::from(ttl)))?;
        }
        Ok(probe)
    }

    fn hop_ref(&self, node: NodeId) -> HopRef {
        let iface = self.lattice.node(node);
        HopRef {
            ttl: iface.ttl,
            addr: iface.addr,
        }
    }
}
