//! Process-wide message bus.
//!
//! Components never reach for a global emitter: they receive an
//! `Arc<dyn MessageBus>` at construction. Topics are plain names
//! (`emit-room`, `connection-opened`, ...) and subscriptions take glob
//! patterns such as `emit-*` or `{join,leave}`.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::ConnectionId;
use crate::error::BusError;

/// Topic names published and consumed by the connection layer.
pub mod topics {
    pub const EMIT_BROADCAST: &str = "emit-broadcast";
    pub const EMIT_ROOM: &str = "emit-room";
    pub const EMIT_USER: &str = "emit-user";
    pub const EMIT_SESSION: &str = "emit-session";
    pub const EMIT_DIRECT: &str = "emit-direct";
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const CONNECTION_OPENED: &str = "connection-opened";
    pub const CONNECTION_CLOSED: &str = "connection-closed";
    pub const LOCAL_CONNECTION_COUNT: &str = "local-connection-count";
    pub const GLOBAL_CONNECTION_COUNT: &str = "global-connection-count";
    pub const DELIVERY_ATTEMPTED_USER: &str = "delivery-attempted-user";
    pub const DELIVERY_ATTEMPTED_SESSION: &str = "delivery-attempted-session";

    /// Everything the router consumes.
    pub const ROUTER_PATTERN: &str = "{emit-*,join,leave}";
}

/// Summary of a connection carried on lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub session_id: String,
}

/// Typed bus payloads. Each variant maps to exactly one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum BusPayload {
    EmitBroadcast {
        event: String,
        args: Vec<Value>,
    },
    EmitRoom {
        room: String,
        event: String,
        args: Vec<Value>,
    },
    EmitUser {
        user_id: String,
        event: String,
        args: Vec<Value>,
    },
    EmitSession {
        session_id: String,
        event: String,
        args: Vec<Value>,
    },
    EmitDirect {
        connection_id: ConnectionId,
        event: String,
        args: Vec<Value>,
    },
    Join {
        connection_id: ConnectionId,
        room: String,
    },
    Leave {
        connection_id: ConnectionId,
        room: String,
    },
    ConnectionOpened(ConnectionSummary),
    ConnectionClosed(ConnectionSummary),
    LocalConnectionCount {
        instance_id: String,
        count: u64,
    },
    GlobalConnectionCount {
        total: u64,
    },
    DeliveryAttemptedUser {
        user_id: String,
        event: String,
        args: Vec<Value>,
        delivered: usize,
    },
    DeliveryAttemptedSession {
        session_id: String,
        event: String,
        args: Vec<Value>,
        delivered: usize,
    },
}

impl BusPayload {
    pub fn topic(&self) -> &'static str {
        match self {
            BusPayload::EmitBroadcast { .. } => topics::EMIT_BROADCAST,
            BusPayload::EmitRoom { .. } => topics::EMIT_ROOM,
            BusPayload::EmitUser { .. } => topics::EMIT_USER,
            BusPayload::EmitSession { .. } => topics::EMIT_SESSION,
            BusPayload::EmitDirect { .. } => topics::EMIT_DIRECT,
            BusPayload::Join { .. } => topics::JOIN,
            BusPayload::Leave { .. } => topics::LEAVE,
            BusPayload::ConnectionOpened(_) => topics::CONNECTION_OPENED,
            BusPayload::ConnectionClosed(_) => topics::CONNECTION_CLOSED,
            BusPayload::LocalConnectionCount { .. } => topics::LOCAL_CONNECTION_COUNT,
            BusPayload::GlobalConnectionCount { .. } => topics::GLOBAL_CONNECTION_COUNT,
            BusPayload::DeliveryAttemptedUser { .. } => topics::DELIVERY_ATTEMPTED_USER,
            BusPayload::DeliveryAttemptedSession { .. } => topics::DELIVERY_ATTEMPTED_SESSION,
        }
    }
}

/// The envelope every bus message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub topic: String,
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: BusPayload,
}

impl BusEvent {
    pub fn new(payload: BusPayload) -> Self {
        Self {
            topic: payload.topic().to_string(),
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// A publish/subscribe channel shared by every component of one process.
pub trait MessageBus: Send + Sync + 'static {
    fn publish(&self, event: BusEvent) -> Result<(), BusError>;
    fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError>;
}

/// In-process bus on a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl MessageBus for BroadcastBus {
    fn publish(&self, event: BusEvent) -> Result<(), BusError> {
        if event.topic.is_empty() {
            return Err(BusError::InvalidTopic(event.topic));
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<BusSubscription, BusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| BusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();

        Ok(BusSubscription {
            matcher,
            receiver: self.sender.subscribe(),
        })
    }
}

/// A filtered view of the bus.
pub struct BusSubscription {
    matcher: GlobMatcher,
    receiver: broadcast::Receiver<BusEvent>,
}

impl BusSubscription {
    /// Wait for the next event whose topic matches the subscription pattern.
    pub async fn recv(&mut self) -> Result<BusEvent, BusError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.matcher.is_match(&event.topic) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(BusError::Lagged(count))
                }
            }
        }
    }
}

/// Typed publisher for feature code that wants to reach connected clients
/// without touching the router directly.
#[derive(Clone)]
pub struct Emitter {
    bus: std::sync::Arc<dyn MessageBus>,
}

impl Emitter {
    pub fn new(bus: std::sync::Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub fn broadcast(&self, event: impl Into<String>, args: Vec<Value>) -> Result<(), BusError> {
        self.publish(BusPayload::EmitBroadcast {
            event: event.into(),
            args,
        })
    }

    pub fn room(
        &self,
        room: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), BusError> {
        self.publish(BusPayload::EmitRoom {
            room: room.into(),
            event: event.into(),
            args,
        })
    }

    pub fn user(
        &self,
        user_id: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), BusError> {
        self.publish(BusPayload::EmitUser {
            user_id: user_id.into(),
            event: event.into(),
            args,
        })
    }

    pub fn session(
        &self,
        session_id: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), BusError> {
        self.publish(BusPayload::EmitSession {
            session_id: session_id.into(),
            event: event.into(),
            args,
        })
    }

    pub fn direct(
        &self,
        connection_id: ConnectionId,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<(), BusError> {
        self.publish(BusPayload::EmitDirect {
            connection_id,
            event: event.into(),
            args,
        })
    }

    pub fn join(
        &self,
        connection_id: ConnectionId,
        room: impl Into<String>,
    ) -> Result<(), BusError> {
        self.publish(BusPayload::Join {
            connection_id,
            room: room.into(),
        })
    }

    pub fn leave(
        &self,
        connection_id: ConnectionId,
        room: impl Into<String>,
    ) -> Result<(), BusError> {
        self.publish(BusPayload::Leave {
            connection_id,
            room: room.into(),
        })
    }

    fn publish(&self, payload: BusPayload) -> Result<(), BusError> {
        self.bus.publish(BusEvent::new(payload))
    }
}
