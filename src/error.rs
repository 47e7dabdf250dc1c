//! Error types for graph operations.

use std::fmt;
use std::sync::Arc;

use crate::PortId;

/// Errors raised by [`FlowGraph`](crate::FlowGraph) operations.
///
/// Programmer misuse (bad handles, incompatible bindings) is reported
/// eagerly; a port left mid-recoherence by an error keeps its stale version
/// and is retried by the next recohere call for the same version.
///
/// Absence is never an error: a missing key or an exhausted cursor is `None`.
#[derive(Debug)]
pub enum FlowError {
    /// The handle does not name a live port in this graph.
    UnknownPort(PortId),

    /// The inlet side of a port already holds a bound input.
    AlreadyBound {
        /// The port whose inlet is occupied.
        port: PortId,
        /// The input it is currently bound to.
        bound: PortId,
    },

    /// The port is not bound to the given input.
    NotBound {
        /// The port whose inlet was to be unbound.
        port: PortId,
        /// The input it was expected to be bound to.
        input: PortId,
    },

    /// A keyed sink was bound to a scalar source, or vice versa. Sink
    /// capabilities are fixed at port construction.
    IncompatibleBinding {
        /// The source (outlet) side of the attempted binding.
        source: PortId,
        /// The sink (inlet) side of the attempted binding.
        sink: PortId,
    },

    /// A keyed operation was applied to a port without keyed state.
    NotKeyed(PortId),

    /// A scalar operation was applied to a keyed port.
    NotScalar(PortId),

    /// A driver mutation was applied to a derived (non-source) port.
    NotASource(PortId),

    /// A port could not be removed because it is still bound.
    StillBound(PortId),

    /// A watch observer failed during recomputation. The watching port's
    /// version is left unstamped, so the next recohere for the same version
    /// retries the observer.
    Watch {
        /// The watching port.
        port: PortId,
        /// The observer's error.
        error: Arc<anyhow::Error>,
    },
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPort(port) => write!(f, "unknown port {port}"),
            Self::AlreadyBound { port, bound } => {
                write!(f, "port {port} is already bound to {bound}")
            }
            Self::NotBound { port, input } => {
                write!(f, "port {port} is not bound to {input}")
            }
            Self::IncompatibleBinding { source, sink } => {
                write!(f, "cannot bind {sink} to {source}: keyed/scalar mismatch")
            }
            Self::NotKeyed(port) => write!(f, "port {port} has no keyed state"),
            Self::NotScalar(port) => {
                write!(f, "port {port} carries keyed state, not a scalar value")
            }
            Self::NotASource(port) => write!(f, "port {port} is not a source port"),
            Self::StillBound(port) => {
                write!(f, "port {port} is still bound; unbind it before removal")
            }
            Self::Watch { port, error } => {
                write!(f, "watch observer failed on port {port}: {error}")
            }
        }
    }
}

impl std::error::Error for FlowError {}
