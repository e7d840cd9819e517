//! # Trellis — Overlay Mesh Router
//!
//! Trellis joins a logical network of peer nodes addressed by string
//! node-IDs, floods a shortest-path routing table across heterogeneous
//! transport backends (TCP, WebSocket, UDP, Unix sockets), and gives
//! local clients datagram and reliable-stream circuits to services
//! bound on any reachable node.
//!
//! ## Architecture
//!
//! The crate is built around one actor — the routing engine — plus a
//! task per backend, per session and per circuit:
//!
//! - Backends produce **sessions**: ordered frame pipes to one peer.
//! - A **link** task wraps each session with the handshake, cost
//!   negotiation, keepalive and frame demultiplexing.
//! - The **routing engine** owns the connection graph and forwarding;
//!   it publishes immutable snapshots that readers consult lock-free.
//! - **Circuits** turn the unreliable routed datagram into user-facing
//!   packet endpoints and reliable streams.
//! - The **node facade** wires it all together as an explicit value;
//!   tests run whole meshes inside one process.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level facade combining all components |
//! | `identity` | Node IDs, allowed-peer policy, service naming |
//! | `frame` | Wire envelope: length, tag, bincode body |
//! | `backend` | Session/backend contracts, dial backoff, shutdown token |
//! | `transport` | TCP, Unix, UDP and WebSocket backends |
//! | `link` | Handshake, keepalive and demux on one session |
//! | `routing` | Flooded topology, Dijkstra, forwarding |
//! | `services` | Per-node service name registry |
//! | `circuit` | Datagram endpoints and reliable streams |
//! | `control` | Text line protocol: status, ping, reload |
//! | `proxy` | Bridges between local sockets and mesh streams |
//! | `config` | Declarative YAML stanzas with an explicit registry |

mod backend;
mod circuit;
pub mod config;
mod control;
mod error;
mod frame;
mod identity;
mod link;
mod node;
pub mod proxy;
mod routing;
mod services;
mod transport;

pub use backend::{Backend, BackendSession, SessionRef, Shutdown};
pub use circuit::{Datagram, PacketConn, Stream, StreamListener, STREAM_MTU, STREAM_WINDOW};
pub use control::{ReloadFn, CONTROL_SERVICE};
pub use error::{NetError, NetResult};
pub use frame::{DataFrame, Frame, DEFAULT_TTL, MAX_FRAME_SIZE};
pub use identity::{AllowedPeers, NodeId};
pub use node::{Node, NodeSettings};
pub use routing::{EngineStatus, Route, RoutingSnapshot, ServiceInfo};
pub use services::{Delivery, UnreachableNotice};
pub use transport::{
    TcpDialerBackend, TcpListenerBackend, UdpDialerBackend, UdpListenerBackend, WsDialerBackend,
    WsListenerBackend,
};
#[cfg(unix)]
pub use transport::{UnixDialerBackend, UnixListenerBackend};
