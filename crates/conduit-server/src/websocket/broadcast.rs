//! Fan-out of lifecycle events to every connected viewer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use conduit_core::HubEvent;

use super::connection::ClientConnection;

/// Connected viewers indexed by connection ID.
pub struct BroadcastManager {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
}

impl BroadcastManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.write().remove(connection_id)
    }

    /// Send `event` to every viewer. Returns how many accepted it.
    ///
    /// Serializes once; viewers with a full queue miss the event.
    pub fn broadcast_all(&self, event: &HubEvent) -> usize {
        let json = match event.to_json() {
            Ok(json) => Arc::new(json),
            Err(error) => {
                warn!(event = event.kind.name(), %error, "failed to serialize event");
                return 0;
            }
        };
        let connections = self.connections.read();
        let delivered = connections
            .values()
            .filter(|conn| conn.send(Arc::clone(&json)))
            .count();
        debug!(
            event = event.kind.name(),
            session_id = %event.session_id,
            recipients = connections.len(),
            delivered,
            "broadcast event"
        );
        delivered
    }

    /// Number of connected viewers.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

impl Default for BroadcastManager {
    fn default() -> Self {
        Self::new()
    }
}
