//! Event types for the FleetHub protocol.
//!
//! Every message exchanged with a client is an envelope of the form
//! `{"event": <name>, "data": <payload>}`. Inbound and outbound events are
//! closed enums, so a new event kind is a compile-time checked addition.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event names as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AuthenticateDriver,
    AuthenticationSuccess,
    DriverLocationUpdate,
    DriverLocationUpdated,
    DriverAssignment,
    AssignmentReceived,
    JoinDriverRoom,
    Error,
}

impl EventKind {
    /// Get the wire name of this event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::AuthenticateDriver => "authenticateDriver",
            EventKind::AuthenticationSuccess => "authenticationSuccess",
            EventKind::DriverLocationUpdate => "driverLocationUpdate",
            EventKind::DriverLocationUpdated => "driverLocationUpdated",
            EventKind::DriverAssignment => "driverAssignment",
            EventKind::AssignmentReceived => "assignmentReceived",
            EventKind::JoinDriverRoom => "joinDriverRoom",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read a driver ID from a JSON value. Numeric IDs are accepted.
#[must_use]
pub fn driver_id_from(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Payload of an `authenticateDriver` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateDriver {
    /// Driver identity to bind the connection to.
    pub driver_id: String,
    /// Optional credential presented alongside the identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl AuthenticateDriver {
    /// Interpret a raw `authenticateDriver` payload.
    ///
    /// Returns `None` if `driverId` is missing or neither a string nor a
    /// number. A non-string `token` is ignored.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let driver_id = driver_id_from(payload.get("driverId")?)?;
        let token = payload
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self { driver_id, token })
    }
}

/// Payload of an `authenticationSuccess` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSuccess {
    /// The driver identity now bound to the connection.
    pub driver_id: String,
}

/// Payload of an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
}

/// An event sent by a client to the hub.
///
/// Only the event name is checked when decoding. Payloads stay raw JSON, so
/// an event with a missing or oddly shaped `data` still reaches the router,
/// which checks authentication before it looks at the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum InboundEvent {
    /// Bind the connection to a driver identity.
    ///
    /// See [`AuthenticateDriver::from_payload`].
    AuthenticateDriver(Option<Value>),

    /// Position report from the authenticated driver.
    ///
    /// The payload is passed through untouched apart from the stamped
    /// `driverId` and `timestamp` fields.
    DriverLocationUpdate(Option<Value>),

    /// Assignment addressed to the driver named by `data.driverId`.
    DriverAssignment(Option<Value>),

    /// Join the `driver-<id>` group. The payload is the driver ID.
    JoinDriverRoom(Option<Value>),
}

impl InboundEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::AuthenticateDriver(_) => EventKind::AuthenticateDriver,
            InboundEvent::DriverLocationUpdate(_) => EventKind::DriverLocationUpdate,
            InboundEvent::DriverAssignment(_) => EventKind::DriverAssignment,
            InboundEvent::JoinDriverRoom(_) => EventKind::JoinDriverRoom,
        }
    }

    /// Whether the event may only be sent by an authenticated connection.
    #[must_use]
    pub fn requires_authentication(&self) -> bool {
        !matches!(self, InboundEvent::AuthenticateDriver(_))
    }

    /// Create an `authenticateDriver` event.
    #[must_use]
    pub fn authenticate(driver_id: impl Into<String>, token: Option<String>) -> Self {
        let request = AuthenticateDriver {
            driver_id: driver_id.into(),
            token,
        };
        InboundEvent::AuthenticateDriver(serde_json::to_value(request).ok())
    }

    /// Create a `driverLocationUpdate` event.
    #[must_use]
    pub fn location_update(payload: Value) -> Self {
        InboundEvent::DriverLocationUpdate(Some(payload))
    }

    /// Create a `driverAssignment` event.
    #[must_use]
    pub fn assignment(payload: Value) -> Self {
        InboundEvent::DriverAssignment(Some(payload))
    }

    /// Create a `joinDriverRoom` event.
    #[must_use]
    pub fn join_driver_room(driver_id: impl Into<String>) -> Self {
        InboundEvent::JoinDriverRoom(Some(Value::String(driver_id.into())))
    }
}

/// An event sent by the hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum OutboundEvent {
    /// Acknowledges `authenticateDriver` to the sender.
    AuthenticationSuccess(AuthenticationSuccess),

    /// Stamped location update, broadcast to every connection.
    DriverLocationUpdated(Map<String, Value>),

    /// Assignment forwarded to a driver group.
    AssignmentReceived(Value),

    /// Error reported to the originating connection.
    Error(ErrorPayload),
}

impl OutboundEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            OutboundEvent::AuthenticationSuccess(_) => EventKind::AuthenticationSuccess,
            OutboundEvent::DriverLocationUpdated(_) => EventKind::DriverLocationUpdated,
            OutboundEvent::AssignmentReceived(_) => EventKind::AssignmentReceived,
            OutboundEvent::Error(_) => EventKind::Error,
        }
    }

    /// Create an `authenticationSuccess` event.
    #[must_use]
    pub fn authentication_success(driver_id: impl Into<String>) -> Self {
        OutboundEvent::AuthenticationSuccess(AuthenticationSuccess {
            driver_id: driver_id.into(),
        })
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        OutboundEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_names() {
        let join = InboundEvent::join_driver_room("D9");
        assert_eq!(join.kind().as_str(), "joinDriverRoom");
        assert_eq!(OutboundEvent::error("x").kind().to_string(), "error");
    }

    #[test]
    fn test_only_authentication_is_unguarded() {
        assert!(!InboundEvent::authenticate("D1", None).requires_authentication());
        assert!(InboundEvent::location_update(json!({})).requires_authentication());
        assert!(InboundEvent::assignment(json!({})).requires_authentication());
        assert!(InboundEvent::join_driver_room("D1").requires_authentication());
    }

    #[test]
    fn test_inbound_envelope_shape() {
        let event: InboundEvent = serde_json::from_value(json!({
            "event": "authenticateDriver",
            "data": { "driverId": "D1", "token": "abc" }
        }))
        .unwrap();

        assert_eq!(event, InboundEvent::authenticate("D1", Some("abc".into())));

        let event: InboundEvent = serde_json::from_value(json!({
            "event": "joinDriverRoom",
            "data": "D9"
        }))
        .unwrap();
        assert_eq!(event, InboundEvent::join_driver_room("D9"));
    }

    #[test]
    fn test_authenticate_token_is_optional() {
        let event: InboundEvent = serde_json::from_value(json!({
            "event": "authenticateDriver",
            "data": { "driverId": "D1" }
        }))
        .unwrap();

        assert_eq!(event, InboundEvent::authenticate("D1", None));
    }

    #[test]
    fn test_outbound_envelope_shape() {
        let value = serde_json::to_value(OutboundEvent::authentication_success("D1")).unwrap();
        assert_eq!(
            value,
            json!({ "event": "authenticationSuccess", "data": { "driverId": "D1" } })
        );

        let value = serde_json::to_value(OutboundEvent::error("Driver not authenticated")).unwrap();
        assert_eq!(
            value,
            json!({ "event": "error", "data": { "message": "Driver not authenticated" } })
        );
    }

    #[test]
    fn test_payload_shape_is_not_checked_on_decode() {
        let event: InboundEvent =
            serde_json::from_value(json!({ "event": "driverLocationUpdate" })).unwrap();
        assert_eq!(event, InboundEvent::DriverLocationUpdate(None));

        let event: InboundEvent =
            serde_json::from_value(json!({ "event": "joinDriverRoom", "data": 42 })).unwrap();
        assert_eq!(event, InboundEvent::JoinDriverRoom(Some(json!(42))));

        let event: InboundEvent = serde_json::from_value(json!({
            "event": "authenticateDriver",
            "data": { "driverId": 7 }
        }))
        .unwrap();
        assert_eq!(event.kind(), EventKind::AuthenticateDriver);
    }

    #[test]
    fn test_authenticate_payload_parsing() {
        let request = AuthenticateDriver::from_payload(&json!({ "driverId": 7, "token": "t" }));
        assert_eq!(
            request,
            Some(AuthenticateDriver {
                driver_id: "7".into(),
                token: Some("t".into()),
            })
        );

        let request = AuthenticateDriver::from_payload(&json!({ "driverId": "D1", "token": 5 }));
        assert_eq!(request.map(|r| r.token), Some(None));

        assert!(AuthenticateDriver::from_payload(&json!({})).is_none());
        assert!(AuthenticateDriver::from_payload(&json!({ "driverId": true })).is_none());
        assert!(AuthenticateDriver::from_payload(&json!("D1")).is_none());
    }

    #[test]
    fn test_driver_id_from_value() {
        assert_eq!(driver_id_from(&json!("D9")).as_deref(), Some("D9"));
        assert_eq!(driver_id_from(&json!(42)).as_deref(), Some("42"));
        assert!(driver_id_from(&json!(null)).is_none());
        assert!(driver_id_from(&json!(["D9"])).is_none());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result: Result<InboundEvent, _> = serde_json::from_value(json!({
            "event": "selfDestruct",
            "data": {}
        }));
        assert!(result.is_err());
    }
}
