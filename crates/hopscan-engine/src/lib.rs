//! # hopscan-engine
//!
//! Probe-orchestration engine for load-balancer-aware path discovery.
//!
//! A single-threaded cooperative event loop multiplexes raw packet I/O
//! against many outstanding probes, runs pluggable traceroute algorithms
//! as state machines on top of that loop, and models the discovered
//! topology as a per-hop lattice of interfaces.
//!
//! ## Crate structure
//!
//! - [`probe`] — Probe/reply model: typed layer fields, schema freeze
//! - [`flow`] — Flow identifiers, the tuple per-flow ECMP hashes on
//! - [`net`] — Network layer: outstanding-probe table, timer wheel, the
//!   raw-socket seam and its `pnet` implementation
//! - [`event`] — Typed events and per-instance delivery queues
//! - [`runtime`] — The cooperative loop and the algorithm emit context
//! - [`algorithm`] — Instance registry and tagged dispatch
//! - [`lattice`] — Layered DAG of discovered hops
//! - [`algorithms`] — Classical/Paris traceroute, MDA, ping

pub mod algorithm;
pub mod algorithms;
pub mod error;
pub mod event;
pub mod flow;
pub mod lattice;
pub mod net;
pub mod probe;
pub mod runtime;

pub use algorithm::{AlgorithmOptions, ALGORITHM_NAMES};
pub use error::{Error, Result};
pub use event::{AlgorithmEvent, Event, HopRef, LinkDiscovered, PingEvent, PingStats};
pub use flow::{FlowId, FlowProto};
pub use lattice::{Interface, Lattice, Link, NodeId};
pub use net::{Family, Network, NetworkConfig, PacketIo, RawChannel, RawReply, DEFAULT_TIMEOUT};
pub use probe::{FieldKind, FieldValue, Probe, ProbeId, Protocol, Reply, ReplyKind};
pub use runtime::{Actions, EventLoop, Handler, InstanceId, LoopState, TerminateHandle};
