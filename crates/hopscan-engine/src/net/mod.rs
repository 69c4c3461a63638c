//! Network I/O layer.
//!
//! Owns the outstanding-probe table (a slab arena keyed by flow identifier
//! ⊕ TTL ⊕ instance tag) and the timer wheel that expires the oldest entry.
//! Replies are matched back to probes here; retries are an algorithm
//! concern and never happen in this layer.
//!
//! For a given probe exactly one of reply, timeout, or ICMP error is ever
//! produced: resolution removes the table entry and bumps nothing else,
//! and stale timer entries are ignored by generation.

pub mod channel;

pub use channel::{Family, PacketIo, RawChannel, RawReply};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use slab::Slab;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::flow::FlowId;
use crate::probe::{Probe, ProbeId, Reply, ReplyKind};
use crate::runtime::InstanceId;

/// Default maximum wait per probe.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-loop network configuration; replaces the original's process-wide
/// globals.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Maximum wait per probe before a timeout event.
    pub timeout: Duration,
    /// Log every send and receive at debug level.
    pub verbose: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            verbose: false,
        }
    }
}

/// An emitted probe the network layer still owns.
#[derive(Debug)]
struct Outstanding {
    probe: Probe,
    flow: FlowId,
    ttl: u8,
    tag: InstanceId,
    generation: u64,
    /// Send order; ambiguous matches resolve to the oldest entry.
    seq: u64,
    sent_at: quanta::Instant,
}

/// The network layer: raw I/O multiplexed against outstanding probes.
pub struct Network<C> {
    channel: C,
    config: NetworkConfig,
    outstanding: Slab<Outstanding>,
    /// Timer wheel: (deadline, slot, generation), earliest first.
    deadlines: BinaryHeap<Reverse<(quanta::Instant, usize, u64)>>,
    next_generation: u64,
    next_seq: u64,
    events: VecDeque<(InstanceId, Event)>,
}

impl<C: PacketIo> Network<C> {
    pub fn new(channel: C, config: NetworkConfig) -> Self {
        Self {
            channel,
            config,
            outstanding: Slab::new(),
            deadlines: BinaryHeap::new(),
            next_generation: 0,
            next_seq: 0,
            events: VecDeque::new(),
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.config.verbose = verbose;
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// Emit a probe on behalf of `tag`.
    ///
    /// The probe is cloned, timestamped at send time, and registered
    /// outstanding until reply-or-timeout. Send failures are fatal.
    pub fn send(&mut self, probe: &Probe, tag: InstanceId) -> Result<ProbeId> {
        let flow = probe.flow_id().ok_or_else(|| {
            Error::NetworkFatal(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "probe has no transport layer",
            ))
        })?;
        let ttl = probe.ttl().ok_or_else(|| {
            Error::NetworkFatal(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "probe has no ttl",
            ))
        })?;

        self.channel.send_probe(probe)?;
        let sent_at = quanta::Instant::now();

        let generation = self.next_generation;
        self.next_generation += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = self.outstanding.insert(Outstanding {
            probe: probe.clone(),
            flow,
            ttl,
            tag,
            generation,
            seq,
            sent_at,
        });
        self.deadlines
            .push(Reverse((sent_at + self.config.timeout, slot, generation)));

        let id = ProbeId { slot, generation };
        if self.config.verbose {
            debug!(probe = %id, ttl, "probe sent");
        }
        Ok(id)
    }

    /// Poll the channel for up to `budget`, converting any inbound message
    /// into an event for its owning instance.
    pub fn poll(&mut self, budget: Duration) -> Result<()> {
        let Some(raw) = self.channel.poll(budget)? else {
            return Ok(());
        };
        self.dispatch(raw);
        Ok(())
    }

    fn dispatch(&mut self, raw: RawReply) {
        let Some(slot) = self.match_reply(&raw) else {
            debug!(from = %raw.from, "reply matched no outstanding probe");
            return;
        };
        let entry = self.outstanding.remove(slot);
        let rtt = raw.recv.duration_since(entry.sent_at);
        let reply = Reply {
            probe: ProbeId {
                slot,
                generation: entry.generation,
            },
            from: raw.from,
            kind: raw.kind,
            probe_ttl: entry.ttl,
            flow: entry.flow,
            recv: raw.recv,
            rtt,
        };
        if self.config.verbose {
            debug!(probe = %reply.probe, from = %reply.from, rtt_us = rtt.as_micros() as u64, "reply");
        }

        // Administrative unreachables from anyone but the destination are
        // surfaced as ICMP errors, not replies.
        let from_destination = entry.probe.dst_ip() == Some(raw.from);
        let event = match raw.kind {
            ReplyKind::Unreachable(_) if !from_destination => Event::IcmpError(reply),
            _ => Event::Reply(reply),
        };
        self.events.push_back((entry.tag, event));
    }

    /// Find the outstanding slot a raw reply belongs to: equal flow
    /// identifier, plus equal TTL when the message quotes one. Ambiguity
    /// resolves to the oldest entry.
    fn match_reply(&self, raw: &RawReply) -> Option<usize> {
        self.outstanding
            .iter()
            .filter(|(_, entry)| {
                entry.flow.matches(&raw.quoted_flow)
                    && raw.quoted_ttl.is_none_or(|t| t == entry.ttl)
            })
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(slot, _)| slot)
    }

    /// Fire the timer wheel: every entry past its deadline produces one
    /// timeout event. Entries resolved by a reply are skipped by
    /// generation.
    pub fn expire(&mut self) {
        let now = quanta::Instant::now();
        while let Some(Reverse((deadline, slot, generation))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            let live = self
                .outstanding
                .get(slot)
                .is_some_and(|e| e.generation == generation);
            if !live {
                continue;
            }
            let entry = self.outstanding.remove(slot);
            if self.config.verbose {
                debug!(slot, ttl = entry.ttl, "probe timed out");
            }
            self.events.push_back((
                entry.tag,
                Event::Timeout {
                    probe: ProbeId {
                        slot,
                        generation: entry.generation,
                    },
                    ttl: entry.ttl,
                    flow: entry.flow,
                },
            ));
        }
    }

    /// The earliest pending deadline, if any probes are outstanding.
    pub fn next_deadline(&self) -> Option<quanta::Instant> {
        self.deadlines.peek().map(|Reverse((d, _, _))| *d)
    }

    pub fn take_event(&mut self) -> Option<(InstanceId, Event)> {
        self.events.pop_front()
    }

    /// Drop every outstanding probe owned by `tag`; late replies for them
    /// will no longer dispatch.
    pub fn drop_instance(&mut self, tag: InstanceId) {
        let slots: Vec<usize> = self
            .outstanding
            .iter()
            .filter(|(_, e)| e.tag == tag)
            .map(|(slot, _)| slot)
            .collect();
        for slot in slots {
            self.outstanding.remove(slot);
        }
        self.events.retain(|(t, _)| *t != tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{FieldValue, Protocol};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    /// Scripted channel: records sends, hands back queued replies.
    #[derive(Default)]
    struct ScriptedChannel {
        sent: Vec<Probe>,
        inbound: VecDeque<RawReply>,
        fail_sends: bool,
    }

    impl PacketIo for ScriptedChannel {
        fn send_probe(&mut self, probe: &Probe) -> io::Result<()> {
            if self.fail_sends {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "raw send"));
            }
            self.sent.push(probe.clone());
            Ok(())
        }

        fn poll(&mut self, _budget: Duration) -> io::Result<Option<RawReply>> {
            Ok(self.inbound.pop_front())
        }
    }

    fn dst() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
    }

    fn probe(ttl: u8, src_port: u16) -> Probe {
        let mut p = Probe::new();
        p.set_protocols(&[Protocol::Ipv4, Protocol::Udp]).unwrap();
        p.set_fields([
            ("dst_ip", FieldValue::Address(dst())),
            ("src_port", FieldValue::I16(src_port)),
            ("dst_port", FieldValue::I16(30000)),
            ("ttl", FieldValue::I8(ttl)),
        ])
        .unwrap();
        p
    }

    fn raw_reply(from: IpAddr, kind: ReplyKind, of: &Probe) -> RawReply {
        RawReply {
            from,
            kind,
            quoted_flow: of.flow_id().unwrap(),
            quoted_ttl: of.ttl(),
            recv: quanta::Instant::now(),
        }
    }

    fn network() -> Network<ScriptedChannel> {
        Network::new(ScriptedChannel::default(), NetworkConfig::default())
    }

    #[test]
    fn reply_matches_by_flow_and_ttl() {
        let mut net = network();
        let p1 = probe(1, 3083);
        let p2 = probe(2, 3083);
        let id1 = net.send(&p1, InstanceId(0)).unwrap();
        let _id2 = net.send(&p2, InstanceId(0)).unwrap();

        let hop = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        net.channel
            .inbound
            .push_back(raw_reply(hop, ReplyKind::TimeExceeded, &p1));
        net.poll(Duration::ZERO).unwrap();

        match net.take_event() {
            Some((InstanceId(0), Event::Reply(reply))) => {
                assert_eq!(reply.probe, id1);
                assert_eq!(reply.from, hop);
                assert_eq!(reply.probe_ttl, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(net.outstanding_len(), 1);
    }

    #[test]
    fn ambiguous_reply_resolves_to_oldest() {
        let mut net = network();
        let p = probe(3, 3083);
        let first = net.send(&p, InstanceId(0)).unwrap();
        let _second = net.send(&p, InstanceId(0)).unwrap();

        net.channel.inbound.push_back(raw_reply(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
            ReplyKind::TimeExceeded,
            &p,
        ));
        net.poll(Duration::ZERO).unwrap();

        match net.take_event() {
            Some((_, Event::Reply(reply))) => assert_eq!(reply.probe, first),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unreachable_from_non_destination_is_icmp_error() {
        let mut net = network();
        let p = probe(4, 3083);
        net.send(&p, InstanceId(0)).unwrap();
        net.channel.inbound.push_back(raw_reply(
            IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)),
            ReplyKind::Unreachable(1),
            &p,
        ));
        net.poll(Duration::ZERO).unwrap();
        assert!(matches!(
            net.take_event(),
            Some((_, Event::IcmpError(_)))
        ));
    }

    #[test]
    fn unreachable_from_destination_is_a_reply() {
        let mut net = network();
        let p = probe(8, 3083);
        net.send(&p, InstanceId(0)).unwrap();
        net.channel
            .inbound
            .push_back(raw_reply(dst(), ReplyKind::Unreachable(3), &p));
        net.poll(Duration::ZERO).unwrap();
        assert!(matches!(net.take_event(), Some((_, Event::Reply(_)))));
    }

    #[test]
    fn timeout_fires_once_and_reply_cancels_it() {
        let mut net = network();
        net.set_timeout(Duration::ZERO);
        let p = probe(1, 3083);
        net.send(&p, InstanceId(0)).unwrap();

        // Reply arrives before the wheel turns: timeout must not fire.
        net.channel.inbound.push_back(raw_reply(
            dst(),
            ReplyKind::Unreachable(3),
            &p,
        ));
        net.poll(Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        net.expire();

        let mut events = 0;
        while net.take_event().is_some() {
            events += 1;
        }
        assert_eq!(events, 1, "exactly one of reply/timeout per probe");
    }

    #[test]
    fn expired_probe_times_out() {
        let mut net = network();
        net.set_timeout(Duration::ZERO);
        let p = probe(5, 3083);
        let id = net.send(&p, InstanceId(2)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        net.expire();
        match net.take_event() {
            Some((InstanceId(2), Event::Timeout { probe, ttl, .. })) => {
                assert_eq!(probe, id);
                assert_eq!(ttl, 5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(net.outstanding_len(), 0);
    }

    #[test]
    fn drop_instance_discards_outstanding_and_late_replies() {
        let mut net = network();
        let p = probe(2, 3083);
        net.send(&p, InstanceId(7)).unwrap();
        net.drop_instance(InstanceId(7));
        assert_eq!(net.outstanding_len(), 0);

        net.channel
            .inbound
            .push_back(raw_reply(dst(), ReplyKind::TimeExceeded, &p));
        net.poll(Duration::ZERO).unwrap();
        assert!(net.take_event().is_none());
    }

    #[test]
    fn send_failure_is_fatal() {
        let mut net = network();
        net.channel.fail_sends = true;
        let err = net.send(&probe(1, 1), InstanceId(0)).unwrap_err();
        assert!(matches!(err, Error::NetworkFatal(_)));
        assert_eq!(net.outstanding_len(), 0);
    }
}
