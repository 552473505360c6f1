use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::types::RemoteApi;

/// Registry of remote clients keyed by workspace id.
///
/// Shared between the scheduler (which issues requests) and the rate
/// limiter (which probes rate limit status).
#[derive(Default)]
pub struct ClientPool {
    clients: RwLock<HashMap<String, Arc<dyn RemoteApi>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client for a workspace.
    pub fn insert(&self, workspace_id: impl Into<String>, client: Arc<dyn RemoteApi>) {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workspace_id.into(), client);
    }

    /// Remove a workspace's client. Returns true if one was registered.
    pub fn remove(&self, workspace_id: &str) -> bool {
        self.clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workspace_id)
            .is_some()
    }

    pub fn get(&self, workspace_id: &str) -> Option<Arc<dyn RemoteApi>> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(workspace_id)
            .cloned()
    }

    /// Registered workspace ids, sorted.
    pub fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
