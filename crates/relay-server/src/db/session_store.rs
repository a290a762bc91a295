use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row};
use relay_core::collaborators::IdentityProvider;
use relay_core::{Principal, RelayError};
use tracing::{debug, instrument, warn};

use super::{Database, DatabaseError};
use crate::session::SessionDirectory;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    name TEXT,
    groups TEXT NOT NULL DEFAULT '[]',
    expires_at TEXT
)";

const INDEX: &str = "CREATE INDEX IF NOT EXISTS sessions_user_id ON sessions (user_id)";

/// Sessions written by the host's login flow into a shared libSQL table.
///
/// `groups` holds a JSON array of group names. Rows whose `expires_at` has
/// passed are ignored.
#[derive(Clone)]
pub struct LibsqlSessionDirectory {
    conn: Connection,
}

impl LibsqlSessionDirectory {
    pub async fn new(db: &Database) -> Result<Self, DatabaseError> {
        let conn = db.connect()?;
        conn.execute(SCHEMA, ()).await?;
        conn.execute(INDEX, ()).await?;
        debug!(database = db.name(), "Sessions table ready");
        Ok(Self { conn })
    }

    /// Store or replace a session.
    #[instrument(skip(self, principal), fields(user_id = %principal.id))]
    pub async fn create_session(
        &self,
        session_id: &str,
        principal: &Principal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let groups = serde_json::to_string(&principal.groups)?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, user_id, name, groups, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    name = excluded.name,
                    groups = excluded.groups,
                    expires_at = excluded.expires_at",
                params![
                    session_id,
                    principal.id.as_str(),
                    principal.name.clone(),
                    groups,
                    expires_at.map(|t| t.to_rfc3339())
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .await?;
        Ok(deleted > 0)
    }

    /// Delete all expired sessions.
    #[instrument(skip(self))]
    pub async fn cleanup_expired_sessions(&self) -> Result<usize, DatabaseError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE expires_at IS NOT NULL AND expires_at < ?1",
                params![Utc::now().to_rfc3339()],
            )
            .await?;
        if deleted > 0 {
            debug!("Cleaned up {} expired sessions", deleted);
        }
        Ok(deleted as usize)
    }

    async fn query_principal(
        &self,
        sql: &str,
        key: &str,
    ) -> Result<Option<Principal>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, params![key, Utc::now().to_rfc3339()])
            .await?;
        match rows.next().await? {
            Some(row) => row_to_principal(&row).map(Some),
            None => Ok(None),
        }
    }
}

fn row_to_principal(row: &Row) -> Result<Principal, DatabaseError> {
    let id: String = row.get(0)?;
    let name: Option<String> = row.get(1).ok();
    let groups: String = row.get(2)?;
    let groups: Vec<String> = serde_json::from_str(&groups).unwrap_or_else(|e| {
        warn!(user_id = %id, error = %e, "Ignoring malformed session groups");
        Vec::new()
    });

    Ok(Principal {
        id,
        name,
        groups,
    })
}

#[async_trait]
impl SessionDirectory for LibsqlSessionDirectory {
    async fn principal_for(&self, session_id: &str) -> Option<Principal> {
        let sql = "SELECT user_id, name, groups FROM sessions
                   WHERE id = ?1 AND (expires_at IS NULL OR expires_at > ?2)";
        match self.query_principal(sql, session_id).await {
            Ok(principal) => principal,
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl IdentityProvider for LibsqlSessionDirectory {
    async fn refresh(&self, principal: &Principal) -> Result<Principal, RelayError> {
        let sql = "SELECT user_id, name, groups FROM sessions
                   WHERE user_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                   LIMIT 1";
        self.query_principal(sql, &principal.id)
            .await
            .map_err(|e| RelayError::collaborator(e.to_string()))?
            .ok_or_else(|| {
                RelayError::unauthorized(format!("no live session for {}", principal.id))
            })
    }
}
