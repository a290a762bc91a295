//! Cross-process connection counts.
//!
//! Each instance owns one entry in a shared store, keyed by its instance id
//! under a deployment namespace. On every connect or disconnect the instance
//! overwrites its own entry, then sums all entries and publishes the result.
//! The sum is eventually consistent: concurrent writers may publish totals
//! that lag by one update.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::bus::{BusEvent, BusPayload, MessageBus};
use crate::error::{RelayError, Result};
use crate::metrics;

/// Which kind of process an instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    Front,
    Compute,
}

impl InstanceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceRole::Front => "front",
            InstanceRole::Compute => "compute",
        }
    }
}

impl FromStr for InstanceRole {
    type Err = RelayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "front" => Ok(InstanceRole::Front),
            "compute" => Ok(InstanceRole::Compute),
            other => Err(RelayError::Config(format!("unknown instance role: {other}"))),
        }
    }
}

/// Identity of one process in presence aggregation: `<role>.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(role: InstanceRole, id: impl AsRef<str>) -> Self {
        Self(format!("{}.{}", role.as_str(), id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace holding all presence entries of one deployment.
pub fn namespace_for(deployment: &str) -> String {
    format!("{deployment}.socket.connections")
}

/// Shared key/value store for presence entries.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Overwrite the entry for `instance_id`.
    async fn put(&self, namespace: &str, instance_id: &str, count: u64) -> Result<()>;

    /// Read every entry in `namespace`.
    async fn entries(&self, namespace: &str) -> Result<HashMap<String, u64>>;

    /// Remove the entry for `instance_id`, if any.
    async fn remove(&self, namespace: &str, instance_id: &str) -> Result<()>;
}

/// In-memory presence store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryPresenceStore {
    namespaces: RwLock<HashMap<String, HashMap<String, u64>>>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn put(&self, namespace: &str, instance_id: &str, count: u64) -> Result<()> {
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(instance_id.to_string(), count);
        Ok(())
    }

    async fn entries(&self, namespace: &str) -> Result<HashMap<String, u64>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove(&self, namespace: &str, instance_id: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        if let Some(entries) = namespaces.get_mut(namespace) {
            entries.remove(instance_id);
            if entries.is_empty() {
                namespaces.remove(namespace);
            }
        }
        Ok(())
    }
}

/// Local and global counts after a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceCounts {
    pub local: u64,
    pub global: u64,
}

/// Publishes this instance's count and the deployment-wide total.
pub struct PresenceAggregator {
    store: Arc<dyn PresenceStore>,
    bus: Arc<dyn MessageBus>,
    namespace: String,
    instance_id: InstanceId,
    last: RwLock<Option<PresenceCounts>>,
}

impl PresenceAggregator {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        bus: Arc<dyn MessageBus>,
        deployment: &str,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            store,
            bus,
            namespace: namespace_for(deployment),
            instance_id,
            last: RwLock::new(None),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Counts from the most recent successful publish.
    pub fn last_counts(&self) -> Option<PresenceCounts> {
        *self.last.read()
    }

    /// Write this instance's count, then publish the local and global totals.
    ///
    /// Only this instance's own entry is ever written.
    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn publish(&self, local_count: u64) -> Result<u64> {
        self.store
            .put(&self.namespace, self.instance_id.as_str(), local_count)
            .await?;

        self.emit(BusPayload::LocalConnectionCount {
            instance_id: self.instance_id.to_string(),
            count: local_count,
        });

        let total = self.sum().await?;
        self.emit(BusPayload::GlobalConnectionCount { total });

        *self.last.write() = Some(PresenceCounts {
            local: local_count,
            global: total,
        });
        metrics::record_connection_counts(local_count, total);
        debug!(local_count, total, "Published presence");

        Ok(total)
    }

    /// Remove this instance's entry and publish the remaining total.
    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn withdraw(&self) -> Result<u64> {
        self.store
            .remove(&self.namespace, self.instance_id.as_str())
            .await?;
        let total = self.sum().await?;
        self.emit(BusPayload::GlobalConnectionCount { total });
        debug!(total, "Withdrew presence");
        Ok(total)
    }

    async fn sum(&self) -> Result<u64> {
        let entries = self.store.entries(&self.namespace).await?;
        Ok(entries.values().sum())
    }

    fn emit(&self, payload: BusPayload) {
        if let Err(e) = self.bus.publish(BusEvent::new(payload)) {
            warn!(error = %e, "Failed to publish presence event");
        }
    }
}

impl fmt::Debug for PresenceAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceAggregator")
            .field("namespace", &self.namespace)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}
