//! In-memory deployment registry
//!
//! Owned by the application root and shared by reference between the
//! deployment and rollback controllers.

use crate::types::Deployment;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Shared deployment registry
#[derive(Default)]
pub struct DeploymentStore {
    inner: RwLock<HashMap<String, Deployment>>,
}

impl DeploymentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a deployment record
    pub fn put(&self, deployment: Deployment) {
        self.inner
            .write()
            .insert(deployment.id.clone(), deployment);
    }

    /// Snapshot a deployment by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Deployment> {
        self.inner.read().get(id).cloned()
    }

    /// Mutate a deployment in place; returns false when absent
    pub fn update<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Deployment),
    {
        let mut inner = self.inner.write();
        match inner.get_mut(id) {
            Some(deployment) => {
                mutate(deployment);
                true
            }
            None => false,
        }
    }

    /// Snapshot every deployment, most recent first
    #[must_use]
    pub fn list(&self) -> Vec<Deployment> {
        let mut all: Vec<Deployment> = self.inner.read().values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }
}
