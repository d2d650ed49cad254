//! Connection registry for FleetHub.
//!
//! The registry tracks every live connection and the driver bindings that
//! point at them. A driver is bound to at most one connection at a time; a
//! newer authentication for the same driver overwrites the binding and the
//! older connection simply stops receiving driver-addressed messages.

use crate::connection::{
    Connection, ConnectionHandle, ConnectionId, ConnectionInfo, DriverId, OutboundSender,
};
use crate::stats::ConnectionStats;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No live connection with this ID.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Outcome of binding a driver to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// The bound driver.
    pub driver_id: DriverId,
    /// The connection the driver is now bound to.
    pub connection_id: ConnectionId,
    /// Another connection that held the binding before, if any.
    pub replaced: Option<ConnectionId>,
}

struct ConnectionEntry {
    connection: Connection,
    handle: ConnectionHandle,
}

/// Registry of live connections and driver bindings.
pub struct Registry {
    /// Live connections indexed by ID.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Driver ID -> bound connection ID.
    bindings: DashMap<DriverId, ConnectionId>,
    /// Connections ever registered. Never decremented.
    lifetime_connections: AtomicU64,
    /// Connections currently registered.
    active_connections: AtomicUsize,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            bindings: DashMap::new(),
            lifetime_connections: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Register a newly accepted connection.
    ///
    /// Returns the connection record with a freshly generated ID.
    pub fn connect(&self, info: ConnectionInfo, sender: OutboundSender) -> Connection {
        let connection = Connection::new(info);
        let handle = ConnectionHandle::new(connection.id.clone(), sender);

        self.connections.insert(
            connection.id.clone(),
            ConnectionEntry {
                connection: connection.clone(),
                handle,
            },
        );
        self.lifetime_connections.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);

        debug!(
            connection = %connection.id,
            remote = ?connection.info.remote_addr,
            user_agent = ?connection.info.user_agent,
            "Connection registered"
        );

        connection
    }

    /// Bind a driver to a connection.
    ///
    /// Overwrites any existing binding for `driver_id` (last writer wins). If the
    /// connection was previously bound to a different driver, that binding is
    /// released as long as it still points at this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub fn authenticate_driver(
        &self,
        connection_id: &ConnectionId,
        driver_id: &str,
    ) -> Result<Binding, RegistryError> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;

        let previous_identity = entry.connection.driver_id.replace(driver_id.to_string());
        if let Some(previous) = previous_identity.filter(|p| p != driver_id) {
            if self
                .bindings
                .remove_if(&previous, |_, bound| bound == connection_id)
                .is_some()
            {
                debug!(connection = %connection_id, driver = %previous, "Released previous driver binding");
            }
        }

        let replaced = self
            .bindings
            .insert(driver_id.to_string(), connection_id.clone())
            .filter(|prev| prev != connection_id);
        drop(entry);

        match &replaced {
            Some(previous) => info!(
                driver = %driver_id,
                connection = %connection_id,
                previous = %previous,
                "Driver binding replaced"
            ),
            None => info!(driver = %driver_id, connection = %connection_id, "Driver authenticated"),
        }

        Ok(Binding {
            driver_id: driver_id.to_string(),
            connection_id: connection_id.clone(),
            replaced,
        })
    }

    /// Unregister a connection.
    ///
    /// The driver binding is removed only if it still points at this
    /// connection, so a late disconnect of an older connection cannot wipe out
    /// a newer one's binding. Returns the removed record, or `None` if the
    /// connection was already gone.
    pub fn disconnect(&self, connection_id: &ConnectionId, reason: &str) -> Option<Connection> {
        let (_, entry) = self.connections.remove(connection_id)?;
        self.active_connections.fetch_sub(1, Ordering::SeqCst);

        let connection = entry.connection;
        if let Some(driver_id) = &connection.driver_id {
            let released = self
                .bindings
                .remove_if(driver_id, |_, bound| bound == connection_id)
                .is_some();
            debug!(
                connection = %connection_id,
                driver = %driver_id,
                released,
                "Driver binding checked on disconnect"
            );
        }

        info!(
            connection = %connection_id,
            driver = ?connection.driver_id,
            reason = %reason,
            "Connection unregistered"
        );

        Some(connection)
    }

    /// Look up the connection currently bound to a driver.
    #[must_use]
    pub fn lookup(&self, driver_id: &str) -> Option<ConnectionId> {
        self.bindings.get(driver_id).map(|bound| bound.value().clone())
    }

    /// Get a copy of a connection record.
    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.connection.clone())
    }

    /// Get the driver identity bound to a connection.
    #[must_use]
    pub fn driver_of(&self, connection_id: &ConnectionId) -> Option<DriverId> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.connection.driver_id.clone())
    }

    /// Get the delivery handle for a connection.
    #[must_use]
    pub fn handle(&self, connection_id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.handle.clone())
    }

    /// Snapshot the delivery handles of every live connection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of driver bindings.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Read the aggregate counters.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            lifetime_connections: self.lifetime_connections.load(Ordering::SeqCst),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            driver_bindings: self.bindings.len(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::outbound_channel;

    fn connect(registry: &Registry) -> Connection {
        let (tx, _rx) = outbound_channel();
        registry.connect(ConnectionInfo::new(), tx)
    }

    #[test]
    fn test_connect_disconnect_counters() {
        let registry = Registry::new();

        let conns: Vec<_> = (0..5).map(|_| connect(&registry)).collect();
        let mut disconnected = 0;
        for conn in conns.iter().take(3) {
            registry.disconnect(&conn.id, "transport close");
            disconnected += 1;

            let stats = registry.stats();
            assert_eq!(
                stats.active_connections as u64,
                stats.lifetime_connections - disconnected
            );
        }

        let stats = registry.stats();
        assert_eq!(stats.lifetime_connections, 5);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let registry = Registry::new();
        let conn = connect(&registry);

        assert!(registry.disconnect(&conn.id, "transport close").is_some());
        assert!(registry.disconnect(&conn.id, "transport close").is_none());

        let stats = registry.stats();
        assert_eq!(stats.lifetime_connections, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_authenticate_binds_driver() {
        let registry = Registry::new();
        let conn = connect(&registry);

        let binding = registry.authenticate_driver(&conn.id, "D1").unwrap();
        assert_eq!(binding.connection_id, conn.id);
        assert!(binding.replaced.is_none());

        assert_eq!(registry.lookup("D1"), Some(conn.id.clone()));
        assert_eq!(registry.driver_of(&conn.id), Some("D1".to_string()));
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn test_newer_binding_survives_stale_disconnect() {
        let registry = Registry::new();
        let c1 = connect(&registry);
        let c2 = connect(&registry);

        registry.authenticate_driver(&c1.id, "D").unwrap();
        let binding = registry.authenticate_driver(&c2.id, "D").unwrap();
        assert_eq!(binding.replaced, Some(c1.id.clone()));

        // The old connection is not forcibly disconnected.
        assert!(registry.get(&c1.id).is_some());

        registry.disconnect(&c1.id, "transport close");
        assert_eq!(registry.lookup("D"), Some(c2.id.clone()));

        registry.disconnect(&c2.id, "transport close");
        assert_eq!(registry.lookup("D"), None);
        assert_eq!(registry.binding_count(), 0);
    }

    #[test]
    fn test_unauthenticated_disconnect_keeps_bindings() {
        let registry = Registry::new();
        let driver = connect(&registry);
        let anonymous = connect(&registry);
        registry.authenticate_driver(&driver.id, "D1").unwrap();

        assert!(registry.disconnect(&anonymous.id, "transport close").is_some());
        assert_eq!(registry.lookup("D1"), Some(driver.id));
        assert_eq!(registry.binding_count(), 1);
    }

    #[test]
    fn test_reauthentication_as_other_driver_releases_old_binding() {
        let registry = Registry::new();
        let conn = connect(&registry);

        registry.authenticate_driver(&conn.id, "D1").unwrap();
        registry.authenticate_driver(&conn.id, "D2").unwrap();

        assert_eq!(registry.lookup("D1"), None);
        assert_eq!(registry.lookup("D2"), Some(conn.id.clone()));
        assert_eq!(registry.driver_of(&conn.id), Some("D2".to_string()));

        // Re-authenticating as the same driver is not a replacement.
        let binding = registry.authenticate_driver(&conn.id, "D2").unwrap();
        assert!(binding.replaced.is_none());
    }

    #[test]
    fn test_authenticate_unknown_connection() {
        let registry = Registry::new();
        let unknown = ConnectionId::from("missing");

        assert_eq!(
            registry.authenticate_driver(&unknown, "D1"),
            Err(RegistryError::UnknownConnection(unknown.clone()))
        );
        assert_eq!(registry.binding_count(), 0);
    }

    #[test]
    fn test_concurrent_authentication_is_last_writer_wins() {
        use std::sync::Arc;

        let registry = Arc::new(Registry::new());
        let conns: Vec<_> = (0..8).map(|_| connect(&registry)).collect();

        let threads: Vec<_> = conns
            .iter()
            .map(|conn| {
                let registry = Arc::clone(&registry);
                let id = conn.id.clone();
                std::thread::spawn(move || {
                    registry.authenticate_driver(&id, "shared").unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        // Exactly one binding, pointing at one of the contenders.
        assert_eq!(registry.binding_count(), 1);
        let winner = registry.lookup("shared").unwrap();
        assert!(conns.iter().any(|c| c.id == winner));

        // Every loser disconnecting leaves the winner's binding intact.
        for conn in conns.iter().filter(|c| c.id != winner) {
            registry.disconnect(&conn.id, "transport close");
        }
        assert_eq!(registry.lookup("shared"), Some(winner));
    }
}
