//! Wire protocol between clients and the connection layer.
//!
//! Frames are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::ConnectionId;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke every call registered under `name`.
    Call {
        id: Value,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Run an HTTP-style handler chain over the socket.
    Route {
        id: Value,
        method: String,
        path: String,
        #[serde(default)]
        query: Map<String, Value>,
        #[serde(default)]
        body: Value,
    },
    Ping,
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: ConnectionId },
    Event { event: String, args: Vec<Value> },
    /// Correlated response, `id` echoes the client's correlation id.
    Reply { id: Value, payload: Value },
    Pong,
}

impl ServerFrame {
    pub fn event(event: impl Into<String>, args: Vec<Value>) -> Self {
        ServerFrame::Event {
            event: event.into(),
            args,
        }
    }

    pub fn reply(id: Value, payload: Value) -> Self {
        ServerFrame::Reply { id, payload }
    }
}
