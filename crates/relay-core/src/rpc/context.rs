use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::connection::{Connection, ConnectionId, Principal};
use crate::error::RelayError;

/// Everything a call handler knows about its caller.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Principal after identity refresh.
    pub principal: Option<Principal>,
    pub connection: Connection,
    /// The path the call was registered under.
    pub path: String,
    pub session_id: String,
    /// Values added by [`CallContextHook`]s.
    pub extensions: Map<String, Value>,
}

impl CallContext {
    pub fn new(
        connection: Connection,
        principal: Option<Principal>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            principal,
            session_id: connection.session_id.clone(),
            connection,
            path: path.into(),
            extensions: Map::new(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.id.as_str())
    }

    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }
}

/// Extends the call context before a handler runs.
///
/// An error fails the call for that registration.
#[async_trait]
pub trait CallContextHook: Send + Sync + 'static {
    async fn extend(&self, ctx: &mut CallContext) -> Result<(), RelayError>;
}
