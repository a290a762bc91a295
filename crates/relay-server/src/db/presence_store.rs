use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{params, Connection};
use relay_core::presence::PresenceStore;
use relay_core::RelayError;
use tracing::{debug, instrument};

use super::{Database, DatabaseError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS presence (
    namespace TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    count INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (namespace, instance_id)
)";

/// Presence entries in a libSQL table, one row per instance.
///
/// Holds a single connection so in-memory databases keep their contents.
#[derive(Clone)]
pub struct LibsqlPresenceStore {
    conn: Connection,
}

impl LibsqlPresenceStore {
    pub async fn new(db: &Database) -> Result<Self, DatabaseError> {
        let conn = db.connect()?;
        conn.execute(SCHEMA, ()).await?;
        debug!(database = db.name(), "Presence table ready");
        Ok(Self { conn })
    }
}

fn store_err(e: libsql::Error) -> RelayError {
    RelayError::store(e.to_string())
}

#[async_trait]
impl PresenceStore for LibsqlPresenceStore {
    #[instrument(skip(self))]
    async fn put(&self, namespace: &str, instance_id: &str, count: u64) -> Result<(), RelayError> {
        let count = i64::try_from(count).map_err(|_| RelayError::store("count out of range"))?;
        self.conn
            .execute(
                "INSERT INTO presence (namespace, instance_id, count, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, instance_id)
                 DO UPDATE SET count = excluded.count, updated_at = excluded.updated_at",
                params![namespace, instance_id, count, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn entries(&self, namespace: &str) -> Result<HashMap<String, u64>, RelayError> {
        let mut rows = self
            .conn
            .query(
                "SELECT instance_id, count FROM presence WHERE namespace = ?1",
                params![namespace],
            )
            .await
            .map_err(store_err)?;

        let mut entries = HashMap::new();
        while let Some(row) = rows.next().await.map_err(store_err)? {
            let instance_id: String = row.get(0).map_err(store_err)?;
            let count: i64 = row.get(1).map_err(store_err)?;
            entries.insert(instance_id, count.max(0) as u64);
        }
        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn remove(&self, namespace: &str, instance_id: &str) -> Result<(), RelayError> {
        self.conn
            .execute(
                "DELETE FROM presence WHERE namespace = ?1 AND instance_id = ?2",
                params![namespace, instance_id],
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
