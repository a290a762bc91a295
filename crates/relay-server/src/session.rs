//! Session lookup for incoming WebSocket upgrades.
//!
//! A session cookie names the session; the directory maps it to the
//! authenticated principal, if any. Upgrades without a cookie get a fresh
//! anonymous session.

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::collaborators::IdentityProvider;
use relay_core::{Principal, RelayError};
use tracing::debug;

/// Resolves session ids to principals.
#[async_trait]
pub trait SessionDirectory: Send + Sync + 'static {
    async fn principal_for(&self, session_id: &str) -> Option<Principal>;
}

/// Sessions held in memory. Also acts as the identity provider: a principal
/// stays valid while at least one session still maps to it.
#[derive(Debug, Default)]
pub struct InMemorySessionDirectory {
    sessions: DashMap<String, Principal>,
}

impl InMemorySessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: impl Into<String>, principal: Principal) {
        self.sessions.insert(session_id.into(), principal);
    }

    pub fn remove(&self, session_id: &str) -> Option<Principal> {
        self.sessions.remove(session_id).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessionDirectory {
    async fn principal_for(&self, session_id: &str) -> Option<Principal> {
        self.sessions.get(session_id).map(|p| p.value().clone())
    }
}

#[async_trait]
impl IdentityProvider for InMemorySessionDirectory {
    async fn refresh(&self, principal: &Principal) -> Result<Principal, RelayError> {
        self.sessions
            .iter()
            .find(|entry| entry.value().id == principal.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::unauthorized(format!("no session for {}", principal.id)))
    }
}

/// Extract the value of cookie `name` from a `Cookie` header.
pub fn session_from_cookie(cookie_header: Option<&str>, name: &str) -> Option<String> {
    cookie_header?
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Session id and principal for an upgrade request.
pub async fn resolve(
    directory: &dyn SessionDirectory,
    cookie_header: Option<&str>,
    cookie_name: &str,
) -> (String, Option<Principal>) {
    match session_from_cookie(cookie_header, cookie_name) {
        Some(session_id) => {
            let principal = directory.principal_for(&session_id).await;
            debug!(
                session_id = %session_id,
                authenticated = principal.is_some(),
                "Resolved session"
            );
            (session_id, principal)
        }
        None => (uuid::Uuid::new_v4().to_string(), None),
    }
}
