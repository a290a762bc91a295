//! Connection Registry implementation.
//!
//! Tracks live connections by id, with secondary indices by user and by
//! session for targeted delivery.
//!
//! All three maps live behind one lock so that a register or unregister is
//! observed atomically: readers never see a connection present in the primary
//! map but missing from an index, or the reverse. Index keys are dropped as
//! soon as their set becomes empty.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument};

use crate::connection::{Connection, ConnectionId};
use crate::error::{RelayError, Result};

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_session: HashMap<String, HashSet<ConnectionId>>,
}

/// Registry of live connections for one process.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
/// registry.register(connection)?;
///
/// for id in registry.lookup_by_user("alice") {
///     // deliver to each of alice's connections
/// }
///
/// registry.unregister(&id);
/// ```
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register a connection and index it by user and session.
    ///
    /// A duplicate id leaves the registry untouched and returns
    /// [`RelayError::RegistryInvariant`]; ids are generated fresh per accept,
    /// so a duplicate means a caller bug.
    #[instrument(skip(self, connection), fields(connection_id = %connection.id))]
    pub fn register(&self, connection: Connection) -> Result<()> {
        let mut state = self.state.write();

        if state.connections.contains_key(&connection.id) {
            error!("Duplicate connection id rejected");
            return Err(RelayError::RegistryInvariant(format!(
                "connection {} is already registered",
                connection.id
            )));
        }

        let id = connection.id.clone();
        if let Some(user_id) = connection.user_id() {
            state
                .by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(id.clone());
        }
        state
            .by_session
            .entry(connection.session_id.clone())
            .or_default()
            .insert(id.clone());

        debug!(
            user_id = ?connection.user_id(),
            session_id = %connection.session_id,
            "Registered connection"
        );
        state.connections.insert(id, connection);

        Ok(())
    }

    /// Remove a connection from the primary map and every index.
    ///
    /// Idempotent: unknown ids return `None` and change nothing.
    #[instrument(skip(self), fields(connection_id = %id))]
    pub fn unregister(&self, id: &ConnectionId) -> Option<Connection> {
        let mut state = self.state.write();
        let connection = state.connections.remove(id)?;

        if let Some(user_id) = connection.user_id() {
            remove_from_index(&mut state.by_user, user_id, id);
        }
        remove_from_index(&mut state.by_session, &connection.session_id, id);

        debug!("Unregistered connection");
        Some(connection)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Connection> {
        self.state.read().connections.get(id).cloned()
    }

    /// All connection ids belonging to a user. Empty for unknown users.
    pub fn lookup_by_user(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.state
            .read()
            .by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All connection ids belonging to a session. Empty for unknown sessions.
    pub fn lookup_by_session(&self, session_id: &str) -> HashSet<ConnectionId> {
        self.state
            .read()
            .by_session
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve a set of ids to live connections, skipping any that went away.
    pub fn resolve(&self, ids: &HashSet<ConnectionId>) -> Vec<Connection> {
        let state = self.state.read();
        ids.iter()
            .filter_map(|id| state.connections.get(id).cloned())
            .collect()
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Connection> {
        self.state.read().connections.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.state.read().by_user.contains_key(user_id)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.state.read().by_session.contains_key(session_id)
    }

    /// Number of distinct users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.state.read().by_user.len()
    }

    /// Number of distinct sessions with at least one connection.
    pub fn session_count(&self) -> usize {
        self.state.read().by_session.len()
    }

    /// Verify that indices and the primary map agree. Used by tests.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let state = self.state.read();
        for (name, index) in [("user", &state.by_user), ("session", &state.by_session)] {
            for (key, ids) in index.iter() {
                if ids.is_empty() {
                    return Err(format!("{name} index key {key} has an empty set"));
                }
                for id in ids {
                    if !state.connections.contains_key(id) {
                        return Err(format!("{name} index key {key} references missing {id}"));
                    }
                }
            }
        }
        for (id, conn) in state.connections.iter() {
            if let Some(user_id) = conn.user_id() {
                if !state.by_user.get(user_id).is_some_and(|s| s.contains(id)) {
                    return Err(format!("connection {id} missing from user index"));
                }
            }
            if !state
                .by_session
                .get(&conn.session_id)
                .is_some_and(|s| s.contains(id))
            {
                return Err(format!("connection {id} missing from session index"));
            }
        }
        Ok(())
    }
}

fn remove_from_index(
    index: &mut HashMap<String, HashSet<ConnectionId>>,
    key: &str,
    id: &ConnectionId,
) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &state.connections.len())
            .field("user_count", &state.by_user.len())
            .field("session_count", &state.by_session.len())
            .finish()
    }
}
