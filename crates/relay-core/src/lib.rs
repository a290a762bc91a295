//! Relay core: the real-time connection layer.
//!
//! This crate tracks live socket connections and everything that happens
//! over them:
//!
//! - [`registry::ConnectionRegistry`] indexes connections by id, user and session
//! - [`routing::MessageRouter`] delivers events to everyone, a room, a user,
//!   a session or a single connection
//! - [`rpc::RpcDispatcher`] runs client calls against registered handlers
//!   and answers with correlated replies
//! - [`bridge::RouteBridge`] runs HTTP-style handler chains for socket clients
//! - [`presence::PresenceAggregator`] sums connection counts across processes
//!
//! [`service::SocketService`] wires them together; transports (the axum
//! WebSocket server in `relay-server`) only implement
//! [`connection::ConnectionHandle`] and [`routing::RoomTransport`].

pub mod bridge;
pub mod bus;
pub mod collaborators;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod rpc;
pub mod service;

pub use bus::{BroadcastBus, BusEvent, BusPayload, Emitter, MessageBus};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionMeta, Principal};
pub use error::{BusError, RelayError, Result};
pub use protocol::{ClientMessage, ServerFrame};
pub use registry::ConnectionRegistry;
pub use routing::{Addressing, MessageRouter, RoomTransport, RoutingResult};
pub use service::{ServiceConfig, SocketService, SocketServiceBuilder};
