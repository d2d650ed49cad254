//! Event router for FleetHub.
//!
//! The router owns the shared hub state (connection registry and group
//! membership) and turns inbound client events into outbound deliveries:
//! unicast acks and errors, fleet-wide broadcasts, and driver-group sends.
//!
//! Every fan-out works on a snapshot of its recipients taken before the first
//! send. Deliveries to connections that have gone away are dropped.

use crate::connection::{
    Connection, ConnectionId, ConnectionInfo, DriverId, OutboundSender, SessionState,
};
use crate::groups::{driver_group, validate_driver_id, GroupMembership, GroupName};
use crate::registry::{Binding, Registry, RegistryError};
use crate::stats::ConnectionStats;
use chrono::{SecondsFormat, Utc};
use fleethub_protocol::{driver_id_from, AuthenticateDriver, InboundEvent, OutboundEvent};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Reported when a driver ID is missing or is neither a string nor a number.
const UNREADABLE_DRIVER_ID: &str = "Driver id must be a string or number";

/// Router errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The event requires an authenticated driver.
    #[error("Driver not authenticated")]
    NotAuthenticated,

    /// Malformed driver ID.
    #[error("Invalid driver id: {0}")]
    InvalidDriverId(&'static str),

    /// Assignment payload without a usable `driverId`.
    #[error("Assignment is missing driverId")]
    MissingAssignmentTarget,

    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl RouterError {
    /// Whether the error is reported back to the originating connection.
    #[must_use]
    pub fn is_client_facing(&self) -> bool {
        !matches!(self, RouterError::UnknownConnection(_))
    }
}

impl From<RegistryError> for RouterError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownConnection(id) => RouterError::UnknownConnection(id),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of simultaneous connections.
    ///
    /// Checked by [`Router::at_capacity`] only; [`Router::connect`] never
    /// refuses a connection.
    pub max_connections: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
        }
    }
}

/// What a successfully dispatched event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The connection is now bound to a driver.
    Authenticated(Binding),
    /// A location update was broadcast.
    Broadcast { recipients: usize },
    /// An assignment was sent to a driver group.
    GroupSend { group: GroupName, recipients: usize },
    /// The connection joined a driver group.
    Joined { group: GroupName, newly_joined: bool },
}

/// The central event router.
pub struct Router {
    /// Live connections and driver bindings.
    registry: Registry,
    /// Driver group membership.
    groups: GroupMembership,
    /// Configuration.
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            registry: Registry::new(),
            groups: GroupMembership::new(),
            config,
        }
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get the group membership table.
    #[must_use]
    pub fn groups(&self) -> &GroupMembership {
        &self.groups
    }

    /// Whether the connection limit has been reached.
    ///
    /// This is a soft limit: the check and the later [`Router::connect`] are
    /// separate steps, so concurrent upgrades may overshoot it briefly.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.registry.connection_count() >= self.config.max_connections
    }

    /// Register a newly admitted connection.
    pub fn connect(&self, info: ConnectionInfo, sender: OutboundSender) -> Connection {
        self.registry.connect(info, sender)
    }

    /// Tear down a connection: leave every group and release its binding.
    ///
    /// Safe to call for connections that never authenticated or that are
    /// already gone.
    pub fn disconnect(&self, connection_id: &ConnectionId, reason: &str) -> Option<Connection> {
        let left = self.groups.leave_all(connection_id);
        if !left.is_empty() {
            debug!(connection = %connection_id, groups = left.len(), "Left groups on disconnect");
        }
        self.registry.disconnect(connection_id, reason)
    }

    /// Record a transport-level error. The connection stays open; the
    /// transport decides whether to close it.
    pub fn transport_error(&self, connection_id: &ConnectionId, error: &dyn fmt::Display) {
        warn!(
            connection = %connection_id,
            driver = ?self.registry.driver_of(connection_id),
            error = %error,
            "Transport error"
        );
    }

    /// Dispatch an inbound event from a connection.
    ///
    /// Errors meant for the client (for example `Driver not authenticated`)
    /// are sent back to the connection as an `error` event before being
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the reason the event was rejected.
    pub fn dispatch(
        &self,
        connection_id: &ConnectionId,
        event: InboundEvent,
    ) -> Result<Dispatched, RouterError> {
        let kind = event.kind();
        trace!(connection = %connection_id, event = %kind, "Dispatching event");

        let result = self.route(connection_id, event);
        if let Err(e) = &result {
            debug!(connection = %connection_id, event = %kind, error = %e, "Event rejected");
            if e.is_client_facing() {
                self.send_to(connection_id, OutboundEvent::error(e.to_string()));
            }
        }
        result
    }

    fn route(
        &self,
        connection_id: &ConnectionId,
        event: InboundEvent,
    ) -> Result<Dispatched, RouterError> {
        // Authentication is checked before any payload is looked at.
        let driver_id = if event.requires_authentication() {
            Some(self.require_driver(connection_id)?)
        } else {
            None
        };

        match (event, driver_id) {
            (InboundEvent::AuthenticateDriver(payload), _) => {
                self.authenticate(connection_id, payload.as_ref())
            }
            (InboundEvent::DriverLocationUpdate(payload), Some(driver_id)) => {
                Ok(self.location_update(&driver_id, payload))
            }
            (InboundEvent::DriverAssignment(payload), Some(_)) => {
                self.assignment(connection_id, payload)
            }
            (InboundEvent::JoinDriverRoom(payload), Some(_)) => {
                self.join_driver_room(connection_id, payload.as_ref())
            }
            (_, None) => Err(RouterError::NotAuthenticated),
        }
    }

    fn require_driver(&self, connection_id: &ConnectionId) -> Result<DriverId, RouterError> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.clone()))?;
        match connection.state() {
            SessionState::Authenticated(driver_id) => Ok(driver_id),
            SessionState::Unauthenticated => Err(RouterError::NotAuthenticated),
        }
    }

    fn authenticate(
        &self,
        connection_id: &ConnectionId,
        payload: Option<&Value>,
    ) -> Result<Dispatched, RouterError> {
        let request = payload
            .and_then(AuthenticateDriver::from_payload)
            .ok_or(RouterError::InvalidDriverId(UNREADABLE_DRIVER_ID))?;
        validate_driver_id(&request.driver_id).map_err(RouterError::InvalidDriverId)?;
        debug!(
            connection = %connection_id,
            driver = %request.driver_id,
            has_token = request.token.is_some(),
            "Authenticate driver"
        );

        let binding = self
            .registry
            .authenticate_driver(connection_id, &request.driver_id)?;
        self.send_to(
            connection_id,
            OutboundEvent::authentication_success(&binding.driver_id),
        );

        Ok(Dispatched::Authenticated(binding))
    }

    fn location_update(&self, driver_id: &str, payload: Option<Value>) -> Dispatched {
        let mut fields = match payload {
            Some(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        fields.insert("driverId".to_string(), Value::String(driver_id.to_string()));
        fields.insert("timestamp".to_string(), Value::String(timestamp_now()));

        let recipients = self.broadcast(OutboundEvent::DriverLocationUpdated(fields));
        debug!(driver = %driver_id, recipients, "Location update broadcast");

        Dispatched::Broadcast { recipients }
    }

    fn assignment(
        &self,
        connection_id: &ConnectionId,
        payload: Option<Value>,
    ) -> Result<Dispatched, RouterError> {
        let payload = payload.ok_or(RouterError::MissingAssignmentTarget)?;
        let target = payload
            .get("driverId")
            .and_then(driver_id_from)
            .ok_or(RouterError::MissingAssignmentTarget)?;
        validate_driver_id(&target).map_err(RouterError::InvalidDriverId)?;

        let group = driver_group(&target);
        let recipients = self.send_to_group(
            &group,
            OutboundEvent::AssignmentReceived(payload),
            Some(connection_id),
        );
        debug!(connection = %connection_id, group = %group, recipients, "Assignment forwarded");

        Ok(Dispatched::GroupSend { group, recipients })
    }

    fn join_driver_room(
        &self,
        connection_id: &ConnectionId,
        payload: Option<&Value>,
    ) -> Result<Dispatched, RouterError> {
        let driver_id = payload
            .and_then(driver_id_from)
            .ok_or(RouterError::InvalidDriverId(UNREADABLE_DRIVER_ID))?;
        validate_driver_id(&driver_id).map_err(RouterError::InvalidDriverId)?;

        let group = driver_group(&driver_id);
        let newly_joined = self.groups.join(connection_id, &group);
        debug!(connection = %connection_id, group = %group, newly_joined, "Joined driver room");

        Ok(Dispatched::Joined {
            group,
            newly_joined,
        })
    }

    /// Send an event to every live connection.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(&self, event: OutboundEvent) -> usize {
        let event = Arc::new(event);
        let recipients = self.registry.snapshot();

        let delivered = recipients
            .iter()
            .filter(|handle| handle.deliver(Arc::clone(&event)))
            .count();
        trace!(event = %event.kind(), recipients = delivered, "Broadcast");
        delivered
    }

    /// Send an event to every member of a group, optionally skipping one
    /// connection (usually the sender).
    ///
    /// Returns the number of connections the event was queued for.
    pub fn send_to_group(
        &self,
        group: &str,
        event: OutboundEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        let event = Arc::new(event);
        let members = self.groups.members(group);

        let delivered = members
            .iter()
            .filter(|id| Some(*id) != except)
            .filter_map(|id| self.registry.handle(id))
            .filter(|handle| handle.deliver(Arc::clone(&event)))
            .count();
        trace!(group = %group, event = %event.kind(), recipients = delivered, "Group send");
        delivered
    }

    /// Send an event to a single connection.
    ///
    /// Returns `false` if the connection is gone.
    pub fn send_to(&self, connection_id: &ConnectionId, event: OutboundEvent) -> bool {
        self.registry
            .handle(connection_id)
            .is_some_and(|handle| handle.deliver(Arc::new(event)))
    }

    /// Send an event to the connection currently bound to a driver.
    ///
    /// Returns `false` if the driver is not connected.
    pub fn send_to_driver(&self, driver_id: &str, event: OutboundEvent) -> bool {
        self.registry
            .lookup(driver_id)
            .is_some_and(|connection_id| self.send_to(&connection_id, event))
    }

    /// Look up the connection currently bound to a driver.
    #[must_use]
    pub fn lookup(&self, driver_id: &str) -> Option<ConnectionId> {
        self.registry.lookup(driver_id)
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.registry.stats()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
