//! Typed events and the per-instance delivery queues.
//!
//! Two classes: engine events (reply, timeout, ICMP error, wake,
//! termination) and algorithm events wrapping algorithm-defined subtypes.
//! The bus preserves post order within a single source; engine events are
//! delivered to the owning instance one per loop iteration in round-robin,
//! while algorithm-posted events go to the user handler.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use crate::error::Error;
use crate::flow::FlowId;
use crate::lattice::Lattice;
use crate::probe::{ProbeId, Reply};
use crate::runtime::InstanceId;

/// An event flowing through the loop.
#[derive(Debug)]
pub enum Event {
    /// A reply matched an outstanding probe.
    Reply(Reply),
    /// An outstanding probe expired without a reply.
    Timeout {
        probe: ProbeId,
        ttl: u8,
        flow: FlowId,
    },
    /// An ICMP administrative failure from a non-destination router.
    IcmpError(Reply),
    /// A timer requested via `Emit::wake_after` fired.
    Wake,
    /// An algorithm-defined event.
    Algorithm(AlgorithmEvent),
    /// The instance's final event; carries its result.
    AlgorithmTerminated(Result<Lattice, Error>),
}

/// Algorithm-defined event subtypes.
#[derive(Debug, Clone)]
pub enum AlgorithmEvent {
    /// MDA confirmed a new link; streamed as discovery progresses.
    MdaNewLink(LinkDiscovered),
    /// MDA hit its branching-point cap at a TTL; discovery is truncated.
    BranchCapReached { ttl: u8 },
    /// Ping progress.
    Ping(PingEvent),
}

/// Endpoints of a link confirmed by MDA, by address and TTL.
///
/// `to` is `None` for a leaf report (an interface with no known successor).
#[derive(Debug, Clone)]
pub struct LinkDiscovered {
    pub from: HopRef,
    pub to: Option<HopRef>,
}

/// An interface reference carried in events: its TTL and address
/// (`None` for the `*` sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopRef {
    pub ttl: u8,
    pub addr: Option<IpAddr>,
}

/// Progress reports from the ping algorithm.
#[derive(Debug, Clone)]
pub enum PingEvent {
    Reply {
        seq: u16,
        from: IpAddr,
        rtt: Duration,
    },
    Timeout {
        seq: u16,
    },
    Summary(PingStats),
}

/// Aggregate ping statistics.
#[derive(Debug, Clone, Default)]
pub struct PingStats {
    pub sent: u64,
    pub received: u64,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    /// Mean RTT in milliseconds.
    pub mean_ms: f64,
    /// Standard deviation of the RTT in milliseconds.
    pub stddev_ms: f64,
}

/// Per-instance FIFO queues plus the user-handler queue.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    instance_queues: HashMap<InstanceId, VecDeque<Event>>,
    user_queue: VecDeque<(InstanceId, Event)>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, id: InstanceId) {
        self.instance_queues.entry(id).or_default();
    }

    pub(crate) fn unregister(&mut self, id: InstanceId) {
        self.instance_queues.remove(&id);
    }

    /// Queue an engine event for its owning instance. Events for unknown
    /// (stopped) instances are dropped.
    pub(crate) fn push_instance(&mut self, id: InstanceId, event: Event) {
        if let Some(queue) = self.instance_queues.get_mut(&id) {
            queue.push_back(event);
        }
    }

    /// Queue an event for the user handler.
    pub(crate) fn push_user(&mut self, id: InstanceId, event: Event) {
        self.user_queue.push_back((id, event));
    }

    pub(crate) fn pop_instance(&mut self, id: InstanceId) -> Option<Event> {
        self.instance_queues.get_mut(&id)?.pop_front()
    }

    pub(crate) fn pop_user(&mut self) -> Option<(InstanceId, Event)> {
        self.user_queue.pop_front()
    }

    /// True when no event is queued anywhere.
    pub(crate) fn is_idle(&self) -> bool {
        self.user_queue.is_empty() && self.instance_queues.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_queue_is_fifo() {
        let mut bus = EventBus::new();
        let id = InstanceId(0);
        bus.register(id);
        bus.push_instance(id, Event::Wake);
        bus.push_instance(
            id,
            Event::Algorithm(AlgorithmEvent::BranchCapReached { ttl: 4 }),
        );
        assert!(matches!(bus.pop_instance(id), Some(Event::Wake)));
        assert!(matches!(bus.pop_instance(id), Some(Event::Algorithm(_))));
        assert!(bus.pop_instance(id).is_none());
    }

    #[test]
    fn events_for_stopped_instances_are_dropped() {
        let mut bus = EventBus::new();
        let id = InstanceId(3);
        bus.register(id);
        bus.unregister(id);
        bus.push_instance(id, Event::Wake);
        assert!(bus.pop_instance(id).is_none());
        assert!(bus.is_idle());
    }
}
