//! libSQL storage for state shared between relay instances.
//!
//! Instances of one deployment point `RELAY_PRESENCE_DB` at the same file
//! (or a Turso embedded replica of it) so their presence entries meet in one
//! table. `RELAY_SESSION_DB` names the database the host's login flow writes
//! sessions into.

mod presence_store;
mod session_store;

use std::path::Path;
use std::sync::Arc;

use libsql::{Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use presence_store::LibsqlPresenceStore;
pub use session_store::LibsqlSessionDirectory;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Failed to encode column value: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Internal database error: {0}")]
    Internal(#[from] libsql::Error),
}

/// Wrapper around a libsql database handle.
#[derive(Clone)]
pub struct Database {
    db: Arc<LibSqlDatabase>,
    name: String,
}

impl Database {
    #[instrument(skip_all)]
    pub async fn in_memory(name: &str) -> Result<Self, DatabaseError> {
        debug!("Creating in-memory database: {}", name);
        let db = libsql::Builder::new_local(":memory:").build().await?;

        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
        })
    }

    /// Create or open a local file-based database.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open_local(name: &str, path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;

        info!("Opened database '{}' at {:?}", name, path);
        Ok(Self {
            db: Arc::new(db),
            name: name.to_string(),
        })
    }

    pub fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
