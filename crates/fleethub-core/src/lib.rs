//! # fleethub-core
//!
//! Presence tracking and event routing for the FleetHub realtime hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Live connections and driver bindings
//! - **Groups** - Per-driver delivery groups
//! - **Auth** - Admission gate with configurable policy
//! - **Router** - Inbound event dispatch and outbound fan-out
//! - **Stats** - Aggregate counters and the periodic reporter
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  AuthGate   │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Groups    │     │StatsReporter│
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod auth;
pub mod connection;
pub mod groups;
pub mod registry;
pub mod router;
pub mod stats;

pub use auth::{AuthError, AuthGate, AuthPolicy, Handshake, StaticTokenValidator, TokenValidator};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionInfo, DriverId};
pub use groups::{driver_group, GroupMembership};
pub use registry::{Binding, Registry, RegistryError};
pub use router::{Dispatched, Router, RouterConfig, RouterError};
pub use stats::{ConnectionStats, StatsReporter, StatsSource};
