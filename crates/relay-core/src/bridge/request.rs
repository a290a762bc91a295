use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::connection::{Connection, ConnectionId, Principal};

/// A route call received from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCall {
    pub id: Value,
    pub method: String,
    pub path: String,
    pub query: Map<String, Value>,
    pub body: Value,
}

/// HTTP-shaped request synthesized from a socket route call.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Upper-cased method.
    pub method: String,
    pub path: String,
    pub query: Map<String, Value>,
    pub body: Value,
    pub headers: BTreeMap<String, String>,
    /// Values bound by `:name` segments of the matched route.
    pub params: HashMap<String, String>,
    pub principal: Option<Principal>,
    pub session_id: String,
    pub connection_id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
}

impl RouteRequest {
    /// Build a request from connection metadata and a client call.
    pub fn synthesize(
        connection: &Connection,
        principal: Option<Principal>,
        call: &RouteCall,
    ) -> Self {
        let mut headers: BTreeMap<String, String> = connection
            .meta
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        headers.insert("accept".to_string(), "application/json".to_string());

        Self {
            method: call.method.to_ascii_uppercase(),
            path: call.path.clone(),
            query: call.query.clone(),
            body: call.body.clone(),
            headers,
            params: HashMap::new(),
            principal,
            session_id: connection.session_id.clone(),
            connection_id: connection.id.clone(),
            remote_addr: connection.meta.remote_addr,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.id.as_str())
    }
}

/// Response captured from a handler chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteReply {
    pub status: u16,
    pub body: Value,
}

impl RouteReply {
    /// 200 with a JSON body.
    pub fn send(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub(crate) fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    /// Wire payload: status code plus the body serialized to a JSON string.
    pub fn to_payload(&self) -> Value {
        json!({
            "statusCode": self.status,
            "bodyJSON": self.body.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CachedHeaders, ConnectionHandle, ConnectionMeta};
    use crate::error::Result;
    use crate::protocol::ServerFrame;
    use std::sync::Arc;

    struct NullHandle;

    impl ConnectionHandle for NullHandle {
        fn send(&self, _frame: ServerFrame) -> Result<()> {
            Ok(())
        }
        fn join(&self, _room: &str) {}
        fn leave(&self, _room: &str) {}
        fn close(&self) {}
    }

    #[test]
    fn test_synthesize_forwards_headers_and_accept() {
        let connection = Connection::new(
            ConnectionId::from("c1"),
            None,
            "s1",
            Arc::new(NullHandle),
        )
        .with_meta(ConnectionMeta {
            remote_addr: None,
            headers: CachedHeaders::capture([("Cookie", "sid=1"), ("Host", "relay.test")]),
        });
        let call = RouteCall {
            id: json!(1),
            method: "post".into(),
            path: "/items".into(),
            query: Map::new(),
            body: json!({"name": "x"}),
        };

        let request = RouteRequest::synthesize(&connection, None, &call);
        assert_eq!(request.method, "POST");
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.header("cookie"), Some("sid=1"));
        assert_eq!(request.header("host"), Some("relay.test"));
        assert_eq!(request.session_id, "s1");
    }

    #[test]
    fn test_reply_payload_serializes_body() {
        let reply = RouteReply::send(json!({"ok": true}));
        assert_eq!(
            reply.to_payload(),
            json!({"statusCode": 200, "bodyJSON": "{\"ok\":true}"})
        );
    }
}
