//! # FleetHub Server
//!
//! WebSocket front end for the FleetHub realtime hub: configuration,
//! connection handling and Prometheus metrics.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
