//! The cooperative event loop.
//!
//! Single-threaded: one iteration polls the network with a bounded
//! quantum, fires expired probe timers and algorithm wake timers,
//! delivers one event per instance in round-robin, hands
//! algorithm-posted events to the user handler, and frees instances
//! that signalled termination. No algorithm callback may block; all
//! waiting is expressed as "probe outstanding, resume on matching
//! event".
//!
//! ```text
//!   Init ──run──▶ Running ──terminate/deadline──▶ Terminating ──▶ Stopped
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;
use tracing::{debug, trace};

use crate::algorithm::{AlgorithmOptions, AlgorithmState, Step};
use crate::error::Result;
use crate::event::{AlgorithmEvent, Event, EventBus};
use crate::net::{Network, NetworkConfig, PacketIo};
use crate::probe::{Probe, ProbeId};

/// Handle of an algorithm instance within its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) usize);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// Loop lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Running,
    Terminating,
    Stopped,
}

/// Requests a user handler may make against the loop; applied after the
/// callback returns.
#[derive(Debug, Default)]
pub struct Actions {
    terminate: bool,
    stops: Vec<InstanceId>,
}

impl Actions {
    /// Stop all instances and break out of `run`.
    pub fn terminate(&mut self) {
        self.terminate = true;
    }

    /// Stop a single instance, dropping its outstanding probes.
    pub fn stop_instance(&mut self, id: InstanceId) {
        self.stops.push(id);
    }
}

/// Cloneable out-of-band termination request, for signal handlers.
#[derive(Debug, Clone, Default)]
pub struct TerminateHandle {
    flag: Arc<AtomicBool>,
}

impl TerminateHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The injector algorithms use for all their side effects.
pub struct Emit<'a, C> {
    pub(crate) net: &'a mut Network<C>,
    pub(crate) bus: &'a mut EventBus,
    pub(crate) wakes: &'a mut BinaryHeap<Reverse<(quanta::Instant, InstanceId)>>,
    pub(crate) id: InstanceId,
}

impl<C: PacketIo> Emit<'_, C> {
    /// Emit a probe; the network layer owns the clone until it resolves.
    pub fn send(&mut self, probe: &Probe) -> Result<ProbeId> {
        self.net.send(probe, self.id)
    }

    /// Post an algorithm event to the user handler.
    pub fn post(&mut self, event: AlgorithmEvent) {
        self.bus.push_user(self.id, Event::Algorithm(event));
    }

    /// Deliver a `Wake` event to this instance after `delay`.
    pub fn wake_after(&mut self, delay: Duration) {
        self.wakes
            .push(Reverse((quanta::Instant::now() + delay, self.id)));
    }
}

struct Instance {
    name: &'static str,
    algorithm: AlgorithmState,
}

/// User callback: receives algorithm events and termination results.
pub type Handler = Box<dyn FnMut(&mut Actions, InstanceId, &Event)>;

/// Upper bound on one network poll, so timers and other instances stay
/// responsive.
const POLL_QUANTUM: Duration = Duration::from_millis(10);

/// The probe-orchestration loop. Owns the network layer, the event bus,
/// and every algorithm instance.
pub struct EventLoop<C> {
    state: LoopState,
    network: Network<C>,
    bus: EventBus,
    instances: Slab<Instance>,
    wakes: BinaryHeap<Reverse<(quanta::Instant, InstanceId)>>,
    handler: Handler,
    stop: TerminateHandle,
}

impl<C: PacketIo> EventLoop<C> {
    pub fn new(channel: C, config: NetworkConfig, handler: Handler) -> Self {
        Self {
            state: LoopState::Init,
            network: Network::new(channel, config),
            bus: EventBus::new(),
            instances: Slab::new(),
            wakes: BinaryHeap::new(),
            handler,
            stop: TerminateHandle::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Per-probe timeout for everything this loop emits.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.network.set_timeout(timeout);
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.network.set_verbose(verbose);
    }

    /// A handle a signal handler can use to request termination.
    pub fn terminate_handle(&self) -> TerminateHandle {
        self.stop.clone()
    }

    /// Create an algorithm instance and start it (its first probes go out
    /// here). Fails on unknown names or mismatched option records.
    pub fn add_algorithm(
        &mut self,
        name: &str,
        options: AlgorithmOptions,
        skeleton: Probe,
    ) -> Result<InstanceId> {
        let (canonical, algorithm) = AlgorithmState::create(name, options, skeleton)?;
        let id = InstanceId(self.instances.insert(Instance {
            name: canonical,
            algorithm,
        }));
        self.bus.register(id);
        debug!(%id, algorithm = canonical, "instance added");

        let step = {
            let instance = self.instances.get_mut(id.0).expect("just inserted");
            let mut emit = Emit {
                net: &mut self.network,
                bus: &mut self.bus,
                wakes: &mut self.wakes,
                id,
            };
            instance.algorithm.on_start(&mut emit)
        };
        self.apply_step(id, step);
        Ok(id)
    }

    /// Run until every instance has terminated, `terminate` is requested,
    /// or the deadline elapses. `None` runs unbounded.
    pub fn run(&mut self, deadline: Option<Duration>) -> Result<()> {
        self.state = LoopState::Running;
        let started = quanta::Instant::now();

        while self.state == LoopState::Running {
            if self.stop.is_requested() {
                self.state = LoopState::Terminating;
                break;
            }
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    self.state = LoopState::Terminating;
                    break;
                }
            }

            self.network.poll(self.poll_budget())?;
            self.network.expire();
            self.fire_wakes();
            while let Some((tag, event)) = self.network.take_event() {
                self.bus.push_instance(tag, event);
            }

            // One event per instance, round-robin in slot order.
            let ids: Vec<InstanceId> = self.instances.iter().map(|(i, _)| InstanceId(i)).collect();
            for id in ids {
                if let Some(event) = self.bus.pop_instance(id) {
                    self.step_instance(id, event);
                }
            }

            self.deliver_user_events()?;
            if self.instances.is_empty() {
                break;
            }
        }

        // Terminating: drop all remaining instances and their probes.
        let ids: Vec<InstanceId> = self.instances.iter().map(|(i, _)| InstanceId(i)).collect();
        for id in ids {
            self.instance_stop(id);
        }
        self.state = LoopState::Stopped;
        debug!("loop stopped");
        Ok(())
    }

    /// Request termination: all instances are stopped and `run` returns
    /// after the current iteration.
    pub fn terminate(&mut self) {
        if self.state == LoopState::Running {
            self.state = LoopState::Terminating;
        }
        self.stop.request();
    }

    /// Remove an instance: its outstanding probes are dropped (late
    /// replies will not dispatch) and its private state is freed.
    pub fn instance_stop(&mut self, id: InstanceId) {
        if self.instances.contains(id.0) {
            let instance = self.instances.remove(id.0);
            trace!(%id, algorithm = instance.name, "instance stopped");
        }
        self.network.drop_instance(id);
        self.bus.unregister(id);
    }

    /// How long the next network poll may block: zero when events are
    /// pending, otherwise bounded by the quantum and the nearest timer.
    fn poll_budget(&self) -> Duration {
        if !self.bus.is_idle() {
            return Duration::ZERO;
        }
        let now = quanta::Instant::now();
        let mut budget = POLL_QUANTUM;
        if let Some(deadline) = self.network.next_deadline() {
            budget = budget.min(deadline.duration_since(now));
        }
        if let Some(Reverse((at, _))) = self.wakes.peek() {
            budget = budget.min(at.duration_since(now));
        }
        budget
    }

    fn fire_wakes(&mut self) {
        let now = quanta::Instant::now();
        while let Some(Reverse((at, id))) = self.wakes.peek().copied() {
            if at > now {
                break;
            }
            self.wakes.pop();
            if self.instances.contains(id.0) {
                self.bus.push_instance(id, Event::Wake);
            }
        }
    }

    fn step_instance(&mut self, id: InstanceId, event: Event) {
        let Some(instance) = self.instances.get_mut(id.0) else {
            return;
        };
        let mut emit = Emit {
            net: &mut self.network,
            bus: &mut self.bus,
            wakes: &mut self.wakes,
            id,
        };
        let step = instance.algorithm.on_event(&mut emit, event);
        self.apply_step(id, step);
    }

    /// Termination (normal or error) posts the instance's final event and
    /// frees its resources; nothing from it can follow.
    fn apply_step(&mut self, id: InstanceId, step: Result<Step>) {
        match step {
            Ok(Step::Continue) => {}
            Ok(Step::Terminated(lattice)) => {
                self.bus.push_user(id, Event::AlgorithmTerminated(Ok(lattice)));
                self.instance_stop(id);
            }
            Err(error) => {
                debug!(%id, %error, "instance aborted");
                self.bus
                    .push_user(id, Event::AlgorithmTerminated(Err(error)));
                self.instance_stop(id);
            }
        }
    }

    fn deliver_user_events(&mut self) -> Result<()> {
        let mut actions = Actions::default();
        while let Some((id, event)) = self.bus.pop_user() {
            (self.handler)(&mut actions, id, &event);
        }
        for id in actions.stops.drain(..) {
            self.instance_stop(id);
        }
        if actions.terminate {
            self.state = LoopState::Terminating;
        }
        Ok(())
    }
}
