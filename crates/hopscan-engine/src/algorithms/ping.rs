//! Echo measurement against a single host.
//!
//! Sends one probe per interval, paced by loop wake timers, and reports
//! per-probe RTTs plus a running summary as algorithm events. Runs until
//! the optional count is reached or the loop is terminated from outside.

use std::collections::HashMap;
use std::time::Duration;

use crate::algorithm::Step;
use crate::error::Result;
use crate::event::{AlgorithmEvent, Event, PingEvent, PingStats};
use crate::lattice::Lattice;
use crate::net::PacketIo;
use crate::probe::{FieldValue, Probe, ProbeId, Reply};
use crate::runtime::Emit;

/// Default TTL when the caller pins none.
const DEFAULT_TTL: u8 = 64;

#[derive(Debug, Clone)]
pub struct PingOptions {
    /// Seconds between sends.
    pub interval: Duration,
    /// Number of probes; `None` runs until terminated.
    pub count: Option<u64>,
    /// Pinned TTL.
    pub ttl: Option<u8>,
    /// Payload size override.
    pub packet_size: Option<usize>,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            count: None,
            ttl: None,
            packet_size: None,
        }
    }
}

/// The paced echo state machine.
#[derive(Debug)]
pub struct Ping {
    opts: PingOptions,
    skeleton: Probe,
    seq: u16,
    /// Outstanding probes by id, with their sequence numbers.
    pending: HashMap<ProbeId, u16>,
    stats: PingStats,
    /// Welford accumulator for the RTT spread.
    m2: f64,
    finished_sending: bool,
}

impl Ping {
    pub(crate) fn new(opts: PingOptions, mut skeleton: Probe) -> Self {
        if let Some(size) = opts.packet_size {
            skeleton.set_payload_size(size);
        }
        Self {
            opts,
            skeleton,
            seq: 0,
            pending: HashMap::new(),
            stats: PingStats::default(),
            m2: 0.0,
            finished_sending: false,
        }
    }

    pub(crate) fn on_start<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        self.send_next(emit)?;
        Ok(Step::Continue)
    }

    pub(crate) fn on_event<C: PacketIo>(
        &mut self,
        emit: &mut Emit<'_, C>,
        event: Event,
    ) -> Result<Step> {
        match event {
            Event::Wake => {
                if !self.finished_sending {
                    self.send_next(emit)?;
                }
                self.maybe_finish(emit)
            }
            Event::Reply(reply) => self.on_reply(emit, &reply),
            Event::Timeout { probe, .. } => self.on_lost(emit, probe),
            Event::IcmpError(reply) => self.on_lost(emit, reply.probe),
            _ => Ok(Step::Continue),
        }
    }

    fn send_next<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<()> {
        if self.opts.count.is_some_and(|count| self.stats.sent >= count) {
            self.finished_sending = true;
            return Ok(());
        }
        let mut probe = self.skeleton.clone();
        probe.set_field(
            "ttl",
            FieldValue::I8(self.opts.ttl.unwrap_or(DEFAULT_TTL)),
        )?;
        let has_icmp = probe
            .protocols()
            .any(|p| matches!(p, crate::probe::Protocol::IcmpV4 | crate::probe::Protocol::IcmpV6));
        if has_icmp {
            probe.set_field("icmp_seq", FieldValue::I16(self.seq))?;
        }
        let id = emit.send(&probe)?;
        self.pending.insert(id, self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.stats.sent += 1;
        emit.wake_after(self.opts.interval);
        Ok(())
    }

    fn on_reply<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>, reply: &Reply) -> Result<Step> {
        let Some(seq) = self.pending.remove(&reply.probe) else {
            return Ok(Step::Continue);
        };
        self.record_rtt(reply.rtt);
        emit.post(AlgorithmEvent::Ping(PingEvent::Reply {
            seq,
            from: reply.from,
            rtt: reply.rtt,
        }));
        self.maybe_finish(emit)
    }

    fn on_lost<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>, probe: ProbeId) -> Result<Step> {
        if let Some(seq) = self.pending.remove(&probe) {
            emit.post(AlgorithmEvent::Ping(PingEvent::Timeout { seq }));
        }
        self.maybe_finish(emit)
    }

    fn record_rtt(&mut self, rtt: Duration) {
        self.stats.received += 1;
        self.stats.min = Some(self.stats.min.map_or(rtt, |m| m.min(rtt)));
        self.stats.max = Some(self.stats.max.map_or(rtt, |m| m.max(rtt)));
        let ms = rtt.as_secs_f64() * 1000.0;
        let delta = ms - self.stats.mean_ms;
        self.stats.mean_ms += delta / self.stats.received as f64;
        self.m2 += delta * (ms - self.stats.mean_ms);
        if self.stats.received > 1 {
            self.stats.stddev_ms = (self.m2 / (self.stats.received - 1) as f64).sqrt();
        }
    }

    /// Terminate once the count is exhausted and nothing is outstanding.
    fn maybe_finish<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        if !self.finished_sending || !self.pending.is_empty() {
            return Ok(Step::Continue);
        }
        emit.post(AlgorithmEvent::Ping(PingEvent::Summary(self.stats.clone())));

        // A minimal lattice: the target interface, when it answered.
        let mut lattice = Lattice::new();
        if self.stats.received > 0 {
            if let Some(dst) = self.skeleton.dst_ip() {
                let root = lattice.add_interface(0, None);
                let target = lattice.add_interface(1, Some(dst));
                lattice.add_link(root, target)?;
            }
        }
        Ok(Step::Terminated(lattice))
    }
}
