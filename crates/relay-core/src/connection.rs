//! Connection identity and the transport handle abstraction.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::ServerFrame;

/// Headers captured at connect time and forwarded into synthetic route requests.
pub const FORWARDED_HEADERS: &[&str] = &[
    "host",
    "origin",
    "cookie",
    "user-agent",
    "accept-encoding",
    "accept-language",
    "x-forwarded-for",
];

/// Opaque per-connection identifier. Generated once, never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// An authenticated user as seen by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Whitelisted request headers, lower-cased names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachedHeaders(BTreeMap<String, String>);

impl CachedHeaders {
    /// Keep only the forwarded header names from an arbitrary header list.
    pub fn capture<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = BTreeMap::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if FORWARDED_HEADERS.contains(&name.as_str()) {
                map.insert(name, value.to_string());
            }
        }
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Transport facts about a connection, captured at accept time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub remote_addr: Option<SocketAddr>,
    pub headers: CachedHeaders,
}

/// The transport side of one live connection.
///
/// Every method must return without waiting on the network.
pub trait ConnectionHandle: Send + Sync + 'static {
    /// Queue a frame for delivery.
    fn send(&self, frame: ServerFrame) -> Result<(), RelayError>;

    /// Add this connection to a transport-native room.
    fn join(&self, room: &str);

    /// Remove this connection from a transport-native room.
    fn leave(&self, room: &str);

    /// Ask the transport to close the connection.
    fn close(&self);
}

/// A registered connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub principal: Option<Principal>,
    pub session_id: String,
    pub handle: Arc<dyn ConnectionHandle>,
    pub meta: ConnectionMeta,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        principal: Option<Principal>,
        session_id: impl Into<String>,
        handle: Arc<dyn ConnectionHandle>,
    ) -> Self {
        Self {
            id,
            principal,
            session_id: session_id.into(),
            handle,
            meta: ConnectionMeta::default(),
            connected_at: Utc::now(),
        }
    }

    pub fn with_meta(mut self, meta: ConnectionMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.id.as_str())
    }

    pub fn summary(&self) -> crate::bus::ConnectionSummary {
        crate::bus::ConnectionSummary {
            connection_id: self.id.clone(),
            user_id: self.user_id().map(str::to_string),
            session_id: self.session_id.clone(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("session_id", &self.session_id)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}
