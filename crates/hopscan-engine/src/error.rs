//! Engine error taxonomy.
//!
//! Transient network conditions (probe timeouts, ICMP unreachables) are not
//! errors: they are delivered as events and absorbed by the algorithms.
//! Everything here either aborts an algorithm instance (surfaced through
//! `AlgorithmTerminated`) or is a programming error at a call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `set_protocols` called after the first field write.
    #[error("probe schema is frozen after the first field write")]
    SchemaFrozen,

    /// A field name that no layer of the probe declares.
    #[error("unknown probe field `{0}`")]
    UnknownField(String),

    /// A field write whose value width does not match the declaration.
    #[error("field `{field}` expects {expected}, got {got}")]
    FieldType {
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    /// A named layer that is not part of the probe's protocol stack.
    #[error("probe has no `{0}` layer")]
    UnknownLayer(String),

    /// `add_link` with endpoints that are not on adjacent TTL layers.
    #[error("non-monotonic link: ttl {from} -> ttl {to}")]
    NonMonotonic { from: u8, to: u8 },

    /// Algorithm name not present in the registry.
    #[error("unknown algorithm `{0}`")]
    UnknownAlgorithm(String),

    /// Options record tagged for a different algorithm than the name given.
    #[error("options for `{options}` passed to algorithm `{algorithm}`")]
    AlgorithmMismatch {
        algorithm: String,
        options: &'static str,
    },

    /// Raw-socket creation or send failure. Aborts the instance and the loop.
    #[error("network fatal: {0}")]
    NetworkFatal(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
