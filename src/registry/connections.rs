//! Registry of live chat connections
//!
//! Maps each connection's identity key to its record. The registry is owned
//! by a server instance and shared by reference with the dispatcher and the
//! per-connection tasks.

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ConnectionKey, ConnectionRecord, ConnectionSender};

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection already registered: {0}")]
    DuplicateKey(ConnectionKey),

    #[error("Connection not found: {0}")]
    NotFound(ConnectionKey),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Tracks every open, admitted connection
///
/// All access goes through one async mutex. A broadcast traverses the map
/// while holding it, so registrations and removals from other connections
/// wait for the traversal to finish and every recipient sees broadcasts in
/// the same order.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionKey, ConnectionRecord>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a newly admitted connection
    ///
    /// Leaves the existing entry untouched and returns `DuplicateKey` if the
    /// key is already present.
    pub async fn register(
        &self,
        key: ConnectionKey,
        sender: ConnectionSender,
    ) -> RegistryResult<ConnectionRecord> {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }

        let record = ConnectionRecord::new(key.clone(), sender);
        connections.insert(key, record.clone());
        debug!("Registered connection ({} total)", connections.len());
        Ok(record)
    }

    /// Insert a connection, overwriting any stale entry under the same key
    pub async fn replace(&self, key: ConnectionKey, sender: ConnectionSender) -> ConnectionRecord {
        let record = ConnectionRecord::new(key.clone(), sender);
        self.connections.lock().await.insert(key, record.clone());
        record
    }

    /// Remove a connection; absent keys are ignored
    pub async fn unregister(&self, key: &ConnectionKey) -> Option<ConnectionRecord> {
        let mut connections = self.connections.lock().await;
        let removed = connections.remove(key);
        if removed.is_some() {
            debug!("Unregistered {} ({} remaining)", key, connections.len());
        }
        removed
    }

    /// Remove a connection only if its entry still delivers to `sender`
    ///
    /// A task whose entry was replaced under the same key gets `None` and
    /// leaves the newer entry in place.
    pub async fn unregister_sender(
        &self,
        key: &ConnectionKey,
        sender: &ConnectionSender,
    ) -> Option<ConnectionRecord> {
        let mut connections = self.connections.lock().await;
        if !connections.get(key)?.is_sender(sender) {
            return None;
        }
        let removed = connections.remove(key);
        debug!("Unregistered {} ({} remaining)", key, connections.len());
        removed
    }

    /// Get a snapshot of a connection's record
    pub async fn lookup(&self, key: &ConnectionKey) -> RegistryResult<ConnectionRecord> {
        self.connections
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.clone()))
    }

    /// Store the trimmed username for a connection; absent keys are ignored
    pub async fn set_username(&self, key: &ConnectionKey, username: &str) {
        if let Some(record) = self.connections.lock().await.get_mut(key) {
            record.set_username(username.trim().to_string());
        }
    }

    /// Visit every registered connection while holding the registry lock
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectionRecord),
    {
        let connections = self.connections.lock().await;
        for record in connections.values() {
            f(record);
        }
    }

    /// Get the number of registered connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Check if no connections are registered
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Usernames of all registered connections, sorted
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .lock()
            .await
            .values()
            .map(|record| record.username().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
