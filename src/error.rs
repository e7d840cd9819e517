//! Error kinds shared across the mesh stack.
//!
//! Every caller-visible failure in trellis is one of the [`NetError`]
//! variants. The distinction matters for propagation policy:
//!
//! - `Timeout` and `Closed` are normal outcomes and are never logged at
//!   error level.
//! - `Transport` failures tear down the affected link and are recovered
//!   by rerouting; they only become user-visible when no route remains.
//! - `Unreachable`, `NoSuchService` and `Reset` break a user contract and
//!   surface through the circuit APIs without crashing the process.
//! - `Config` is fatal at startup.

use thiserror::Error;

use crate::identity::NodeId;

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

/// Errors produced by sessions, routing, services and circuits.
#[derive(Debug, Error)]
pub enum NetError {
    /// A deadline elapsed before the operation completed. The operation
    /// consumed nothing; retrying is always safe.
    #[error("operation timed out")]
    Timeout,

    /// Normal end-of-life of a session, stream or listener.
    #[error("connection closed")]
    Closed,

    /// I/O failure on an underlying transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(String),

    /// No route to the destination node, or the route vanished while a
    /// frame was in flight.
    #[error("no route to node {0}")]
    Unreachable(NodeId),

    /// The destination node is reachable but has no such service bound.
    #[error("node {node} has no service {service:?}")]
    NoSuchService { node: NodeId, service: String },

    /// A second bind of an already-bound service name.
    #[error("service name already bound: {0:?}")]
    NameInUse(String),

    /// A handshake or bind was rejected by local policy.
    #[error("rejected by policy: {0}")]
    PolicyReject(String),

    /// The remote endpoint aborted a reliable stream.
    #[error("stream reset by peer")]
    Reset,

    /// Invalid configuration; fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NetError {
    /// True for the two variants that signal normal termination rather
    /// than a fault.
    pub fn is_benign(&self) -> bool {
        matches!(self, NetError::Timeout | NetError::Closed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, NetError::Closed)
    }
}

impl From<bincode::Error> for NetError {
    fn from(e: bincode::Error) -> Self {
        NetError::Codec(e.to_string())
    }
}
