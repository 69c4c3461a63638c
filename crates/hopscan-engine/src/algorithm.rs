//! Algorithm runtime: registry, options union, tagged dispatch.
//!
//! The algorithms form a closed set, so instances are tagged variants
//! with a common operation table rather than trait objects. Options are
//! per-algorithm records behind an enum-tagged union; a mismatch between
//! the registry name and the options tag is caught before any packet is
//! emitted.

use crate::algorithms::mda::{Mda, MdaOptions};
use crate::algorithms::ping::{Ping, PingOptions};
use crate::algorithms::traceroute::{Traceroute, TracerouteMode, TracerouteOptions};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::lattice::Lattice;
use crate::net::PacketIo;
use crate::probe::Probe;
use crate::runtime::Emit;

/// Names the registry accepts.
pub const ALGORITHM_NAMES: &[&str] = &["mda", "traceroute", "paris-traceroute", "ping"];

/// Per-algorithm options records.
#[derive(Debug, Clone)]
pub enum AlgorithmOptions {
    Traceroute(TracerouteOptions),
    Mda(MdaOptions),
    Ping(PingOptions),
}

impl AlgorithmOptions {
    const fn tag(&self) -> &'static str {
        match self {
            Self::Traceroute(_) => "traceroute",
            Self::Mda(_) => "mda",
            Self::Ping(_) => "ping",
        }
    }
}

/// What an algorithm step asks of the loop.
pub(crate) enum Step {
    Continue,
    /// Final result; the loop posts `AlgorithmTerminated` and frees the
    /// instance.
    Terminated(Lattice),
}

/// A live algorithm, dispatched by variant.
#[derive(Debug)]
pub(crate) enum AlgorithmState {
    Traceroute(Traceroute),
    Mda(Mda),
    Ping(Ping),
}

impl AlgorithmState {
    /// Look up `name` and build the instance state. Returns the canonical
    /// registry name alongside.
    pub(crate) fn create(
        name: &str,
        options: AlgorithmOptions,
        skeleton: Probe,
    ) -> Result<(&'static str, Self)> {
        match name {
            "traceroute" | "paris-traceroute" => {
                let AlgorithmOptions::Traceroute(opts) = options else {
                    return Err(Error::AlgorithmMismatch {
                        algorithm: name.to_string(),
                        options: options.tag(),
                    });
                };
                let mode = if name == "paris-traceroute" {
                    TracerouteMode::Paris
                } else {
                    TracerouteMode::Classic
                };
                let canonical = if mode == TracerouteMode::Paris {
                    "paris-traceroute"
                } else {
                    "traceroute"
                };
                Ok((canonical, Self::Traceroute(Traceroute::new(opts, mode, skeleton))))
            }
            "mda" => {
                let AlgorithmOptions::Mda(opts) = options else {
                    return Err(Error::AlgorithmMismatch {
                        algorithm: name.to_string(),
                        options: options.tag(),
                    });
                };
                Ok(("mda", Self::Mda(Mda::new(opts, skeleton))))
            }
            "ping" => {
                let AlgorithmOptions::Ping(opts) = options else {
                    return Err(Error::AlgorithmMismatch {
                        algorithm: name.to_string(),
                        options: options.tag(),
                    });
                };
                Ok(("ping", Self::Ping(Ping::new(opts, skeleton))))
            }
            other => Err(Error::UnknownAlgorithm(other.to_string())),
        }
    }

    /// Emit the instance's first probes.
    pub(crate) fn on_start<C: PacketIo>(&mut self, emit: &mut Emit<'_, C>) -> Result<Step> {
        match self {
            Self::Traceroute(algo) => algo.on_start(emit),
            Self::Mda(algo) => algo.on_start(emit),
            Self::Ping(algo) => algo.on_start(emit),
        }
    }

    /// Step the instance on one delivered event.
    pub(crate) fn on_event<C: PacketIo>(
        &mut self,
        emit: &mut Emit<'_, C>,
        event: Event,
    ) -> Result<Step> {
        match self {
            Self::Traceroute(algo) => algo.on_event(emit, event),
            Self::Mda(algo) => algo.on_event(emit, event),
            Self::Ping(algo) => algo.on_event(emit, event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Protocol;

    fn skeleton() -> Probe {
        let mut probe = Probe::new();
        probe
            .set_protocols(&[Protocol::Ipv4, Protocol::Udp])
            .unwrap();
        probe
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = AlgorithmState::create(
            "dublin-traceroute",
            AlgorithmOptions::Traceroute(TracerouteOptions::default()),
            skeleton(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownAlgorithm(_)));
    }

    #[test]
    fn mismatched_options_are_rejected() {
        let err = AlgorithmState::create(
            "mda",
            AlgorithmOptions::Traceroute(TracerouteOptions::default()),
            skeleton(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::AlgorithmMismatch {
                options: "traceroute",
                ..
            }
        ));
    }

    #[test]
    fn registry_accepts_all_names() {
        for name in ALGORITHM_NAMES {
            let options = match *name {
                "mda" => AlgorithmOptions::Mda(MdaOptions::default()),
                "ping" => AlgorithmOptions::Ping(PingOptions::default()),
                _ => AlgorithmOptions::Traceroute(TracerouteOptions::default()),
            };
            assert!(AlgorithmState::create(name, options, skeleton()).is_ok());
        }
    }
}
