//! # fleethub-protocol
//!
//! Wire protocol definitions for the FleetHub realtime hub.
//!
//! This crate defines the events exchanged between drivers, dispatch
//! dashboards and the hub, and the codecs used to put them on the wire.
//!
//! ## Events
//!
//! - `authenticateDriver` / `authenticationSuccess` - Identity binding
//! - `driverLocationUpdate` / `driverLocationUpdated` - Fleet-wide positions
//! - `driverAssignment` / `assignmentReceived` - Targeted delivery
//! - `joinDriverRoom` - Group membership
//! - `error` - Guard failures
//!
//! ## Example
//!
//! ```rust
//! use fleethub_protocol::{codec, InboundEvent};
//!
//! let event = InboundEvent::join_driver_room("D9");
//!
//! let text = codec::encode_json(&event).unwrap();
//! let decoded: InboundEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;

pub use codec::{Encoded, ProtocolError, WireFormat};
pub use events::{
    driver_id_from, AuthenticateDriver, AuthenticationSuccess, ErrorPayload, EventKind,
    InboundEvent, OutboundEvent,
};
