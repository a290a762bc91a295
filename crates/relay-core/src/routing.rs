//! Message routing for outbound events.
//!
//! The router turns an addressing mode plus an event into frames queued on
//! the right connections. Rooms are owned by the transport; users, sessions
//! and direct ids resolve through the [`ConnectionRegistry`].

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::bus::{topics, BusEvent, BusPayload, MessageBus};
use crate::connection::{Connection, ConnectionId};
use crate::error::BusError;
use crate::metrics;
use crate::protocol::ServerFrame;
use crate::registry::ConnectionRegistry;

/// Who an outbound event is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    Broadcast,
    Room(String),
    User(String),
    Session(String),
    Direct(ConnectionId),
}

impl Addressing {
    fn mode(&self) -> &'static str {
        match self {
            Addressing::Broadcast => "broadcast",
            Addressing::Room(_) => "room",
            Addressing::User(_) => "user",
            Addressing::Session(_) => "session",
            Addressing::Direct(_) => "direct",
        }
    }
}

/// Transport-native room delivery.
pub trait RoomTransport: Send + Sync + 'static {
    /// Queue a frame for every current member of `room`; returns how many
    /// members it was queued for.
    fn emit_to_room(&self, room: &str, frame: ServerFrame) -> usize;
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingResult {
    /// Frames were handed to at least one connection.
    Delivered {
        delivered_count: usize,
        failed_count: usize,
    },
    /// The audience was empty. Not an error.
    NoRecipients,
}

impl RoutingResult {
    pub fn delivered_count(&self) -> usize {
        match self {
            RoutingResult::Delivered {
                delivered_count, ..
            } => *delivered_count,
            RoutingResult::NoRecipients => 0,
        }
    }
}

/// Routes events to connections on this process.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<dyn RoomTransport>,
    bus: Arc<dyn MessageBus>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<dyn RoomTransport>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        info!("Creating message router");
        Self {
            registry,
            rooms,
            bus,
        }
    }

    /// Deliver `event(args...)` to the addressed audience.
    ///
    /// Unknown users, sessions and connection ids are skipped silently. User
    /// and session routes publish a delivery-attempted notification whether
    /// or not anyone was online.
    #[instrument(skip(self, args), fields(mode = addressing.mode()))]
    pub fn route(&self, addressing: Addressing, event: &str, args: Vec<Value>) -> RoutingResult {
        let frame = ServerFrame::event(event, args.clone());

        let result = match &addressing {
            Addressing::Broadcast => self.deliver_all(self.registry.connections(), &frame),
            Addressing::Room(room) => match self.rooms.emit_to_room(room, frame) {
                0 => RoutingResult::NoRecipients,
                n => RoutingResult::Delivered {
                    delivered_count: n,
                    failed_count: 0,
                },
            },
            Addressing::User(user_id) => {
                self.deliver_ids(&self.registry.lookup_by_user(user_id), &frame)
            }
            Addressing::Session(session_id) => {
                self.deliver_ids(&self.registry.lookup_by_session(session_id), &frame)
            }
            Addressing::Direct(id) => match self.registry.lookup(id) {
                Some(connection) => self.deliver_all(vec![connection], &frame),
                None => {
                    trace!(connection_id = %id, "Direct target not connected");
                    RoutingResult::NoRecipients
                }
            },
        };

        metrics::record_deliveries(addressing.mode(), result.delivered_count());

        let delivered = result.delivered_count();
        let notice = match addressing {
            Addressing::User(user_id) => Some(BusPayload::DeliveryAttemptedUser {
                user_id,
                event: event.to_string(),
                args,
                delivered,
            }),
            Addressing::Session(session_id) => Some(BusPayload::DeliveryAttemptedSession {
                session_id,
                event: event.to_string(),
                args,
                delivered,
            }),
            _ => None,
        };
        if let Some(payload) = notice {
            if let Err(e) = self.bus.publish(BusEvent::new(payload)) {
                warn!(error = %e, "Failed to publish delivery notification");
            }
        }

        debug!(?result, "Routed event");
        result
    }

    /// Add a connection to a room. Unknown connections are ignored.
    pub fn join(&self, id: &ConnectionId, room: &str) -> bool {
        match self.registry.lookup(id) {
            Some(connection) => {
                connection.handle.join(room);
                debug!(connection_id = %id, room, "Joined room");
                true
            }
            None => false,
        }
    }

    /// Remove a connection from a room. Unknown connections are ignored.
    pub fn leave(&self, id: &ConnectionId, room: &str) -> bool {
        match self.registry.lookup(id) {
            Some(connection) => {
                connection.handle.leave(room);
                debug!(connection_id = %id, room, "Left room");
                true
            }
            None => false,
        }
    }

    /// Apply one bus event. Events the router does not consume are ignored.
    pub fn handle_bus_event(&self, event: BusEvent) {
        match event.payload {
            BusPayload::EmitBroadcast { event, args } => {
                self.route(Addressing::Broadcast, &event, args);
            }
            BusPayload::EmitRoom { room, event, args } => {
                self.route(Addressing::Room(room), &event, args);
            }
            BusPayload::EmitUser {
                user_id,
                event,
                args,
            } => {
                self.route(Addressing::User(user_id), &event, args);
            }
            BusPayload::EmitSession {
                session_id,
                event,
                args,
            } => {
                self.route(Addressing::Session(session_id), &event, args);
            }
            BusPayload::EmitDirect {
                connection_id,
                event,
                args,
            } => {
                self.route(Addressing::Direct(connection_id), &event, args);
            }
            BusPayload::Join {
                connection_id,
                room,
            } => {
                self.join(&connection_id, &room);
            }
            BusPayload::Leave {
                connection_id,
                room,
            } => {
                self.leave(&connection_id, &room);
            }
            other => trace!(topic = other.topic(), "Ignoring bus event"),
        }
    }

    /// Subscribe to the router topics and apply them until `shutdown` fires.
    ///
    /// The subscription is taken before this returns, so events published
    /// afterwards are never missed.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.bus.subscribe(topics::ROUTER_PATTERN)?;
        let router = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = subscription.recv() => match received {
                        Ok(event) => router.handle_bus_event(event),
                        Err(BusError::Lagged(missed)) => {
                            warn!(missed, "Router lagged behind the bus");
                        }
                        Err(e) => {
                            warn!(error = %e, "Router bus subscription ended");
                            break;
                        }
                    }
                }
            }
            debug!("Router loop stopped");
        }))
    }

    fn deliver_ids(&self, ids: &HashSet<ConnectionId>, frame: &ServerFrame) -> RoutingResult {
        self.deliver_all(self.registry.resolve(ids), frame)
    }

    fn deliver_all(&self, connections: Vec<Connection>, frame: &ServerFrame) -> RoutingResult {
        if connections.is_empty() {
            return RoutingResult::NoRecipients;
        }

        let mut delivered_count = 0;
        let mut failed_count = 0;
        for connection in connections {
            match connection.handle.send(frame.clone()) {
                Ok(()) => delivered_count += 1,
                Err(e) => {
                    debug!(connection_id = %connection.id, error = %e, "Delivery failed");
                    failed_count += 1;
                }
            }
        }

        RoutingResult::Delivered {
            delivered_count,
            failed_count,
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .finish()
    }
}
