//! Call tables.
//!
//! A [`CallTable`] never changes once built. Registration changes build a
//! new table with the next epoch and swap it in; dispatch works from an
//! `Arc` snapshot so it never observes a table mid-rebuild.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::CallHandler;
use crate::collaborators::AclRequirement;

/// One handler registered under a call path.
#[derive(Clone)]
pub struct CallRegistration {
    pub path: String,
    pub requirement: Option<AclRequirement>,
    pub handler: Arc<dyn CallHandler>,
}

impl fmt::Debug for CallRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRegistration")
            .field("path", &self.path)
            .field("requirement", &self.requirement)
            .finish()
    }
}

/// Immutable path to registrations map for one epoch.
#[derive(Debug, Default)]
pub struct CallTable {
    epoch: u64,
    calls: HashMap<String, Vec<CallRegistration>>,
}

impl CallTable {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Every registration for `path`, in registration order.
    pub fn lookup(&self, path: &str) -> &[CallRegistration] {
        self.calls.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.calls.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Total number of registrations across all paths.
    pub fn len(&self) -> usize {
        self.calls.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Mutable staging area for the next table.
#[derive(Debug, Default)]
pub struct CallTableBuilder {
    registrations: Vec<CallRegistration>,
}

impl CallTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        handler: Arc<dyn CallHandler>,
    ) -> &mut Self {
        self.registrations.push(CallRegistration {
            path: path.into(),
            requirement: None,
            handler,
        });
        self
    }

    pub fn register_with_acl(
        &mut self,
        path: impl Into<String>,
        requirement: AclRequirement,
        handler: Arc<dyn CallHandler>,
    ) -> &mut Self {
        self.registrations.push(CallRegistration {
            path: path.into(),
            requirement: Some(requirement),
            handler,
        });
        self
    }

    /// Drop every registration under `path`.
    pub fn remove_path(&mut self, path: &str) -> &mut Self {
        self.registrations.retain(|r| r.path != path);
        self
    }

    fn from_table(table: &CallTable) -> Self {
        let mut registrations: Vec<CallRegistration> = Vec::with_capacity(table.len());
        let mut paths: Vec<&String> = table.calls.keys().collect();
        paths.sort_unstable();
        for path in paths {
            registrations.extend(table.calls[path].iter().cloned());
        }
        Self { registrations }
    }

    fn build(self, epoch: u64) -> CallTable {
        let mut calls: HashMap<String, Vec<CallRegistration>> = HashMap::new();
        for registration in self.registrations {
            calls
                .entry(registration.path.clone())
                .or_default()
                .push(registration);
        }
        CallTable { epoch, calls }
    }
}

/// Holder of the current call table.
#[derive(Debug)]
pub struct CallRegistry {
    current: RwLock<Arc<CallTable>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CallTable::default())),
        }
    }

    /// The table in effect right now.
    pub fn snapshot(&self) -> Arc<CallTable> {
        Arc::clone(&self.current.read())
    }

    /// Replace the whole table. Returns the new epoch.
    pub fn replace(&self, builder: CallTableBuilder) -> u64 {
        let mut current = self.current.write();
        let epoch = current.epoch + 1;
        let table = builder.build(epoch);
        info!(epoch, registrations = table.len(), "Installed call table");
        *current = Arc::new(table);
        epoch
    }

    /// Derive a new table from the current one. Concurrent updates are
    /// applied one after another. Returns the new epoch.
    pub fn update<F>(&self, apply: F) -> u64
    where
        F: FnOnce(&mut CallTableBuilder),
    {
        let mut current = self.current.write();
        let mut builder = CallTableBuilder::from_table(&current);
        apply(&mut builder);
        let epoch = current.epoch + 1;
        let table = builder.build(epoch);
        info!(epoch, registrations = table.len(), "Updated call table");
        *current = Arc::new(table);
        epoch
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
