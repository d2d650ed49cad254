//! Connection records for FleetHub.
//!
//! A connection is one live transport session. The hub never touches the
//! transport directly: each connection hands the registry the sending half of
//! an outbound queue, and the transport task drains the other half.

use chrono::{DateTime, Utc};
use fleethub_protocol::OutboundEvent;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

/// A driver identity.
pub type DriverId = String;

/// Default number of events a connection may have queued.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<Arc<OutboundEvent>>;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Arc<OutboundEvent>>;

/// Create an outbound queue with the default capacity.
#[must_use]
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    outbound_channel_with_capacity(DEFAULT_OUTBOUND_CAPACITY)
}

/// Create an outbound queue holding at most `capacity` events.
#[must_use]
pub fn outbound_channel_with_capacity(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport-level facts recorded when a connection is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Peer address, if the transport exposes one.
    pub remote_addr: Option<SocketAddr>,
    /// `User-Agent` sent with the upgrade request.
    pub user_agent: Option<String>,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

impl ConnectionInfo {
    /// Create connection info stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            remote_addr: None,
            user_agent: None,
            connected_at: Utc::now(),
        }
    }

    /// Set the remote address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Authentication state of a connection.
///
/// The only transition is `Unauthenticated -> Authenticated`; re-authenticating
/// replaces the driver identity but never returns to `Unauthenticated`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(DriverId),
}

/// A live connection as recorded by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Driver identity, set by `authenticateDriver`.
    pub driver_id: Option<DriverId>,
    /// Transport-level details.
    pub info: ConnectionInfo,
}

impl Connection {
    /// Create an unauthenticated connection record with a fresh ID.
    #[must_use]
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            id: ConnectionId::generate(),
            driver_id: None,
            info,
        }
    }

    /// Get the authentication state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        match &self.driver_id {
            Some(driver_id) => SessionState::Authenticated(driver_id.clone()),
            None => SessionState::Unauthenticated,
        }
    }

    /// Whether a driver identity is bound to this connection.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.driver_id.is_some()
    }
}

/// The outbound side of a connection, as used for delivery.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection identifier.
    pub id: ConnectionId,
    sender: OutboundSender,
}

impl ConnectionHandle {
    /// Create a handle from a connection ID and its outbound queue.
    #[must_use]
    pub fn new(id: ConnectionId, sender: OutboundSender) -> Self {
        Self { id, sender }
    }

    /// Queue an event for delivery without waiting.
    ///
    /// Returns `false` if the connection has gone away or its queue is full.
    /// The event is dropped in both cases.
    pub fn deliver(&self, event: Arc<OutboundEvent>) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                debug!(connection = %self.id, event = %event.kind(), "Outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the receiving side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
