//! Journey worker orchestrator
//!
//! Spawns one short-lived worker process per journey step and tenant, hands
//! each a port from a fixed range, and keeps those workers healthy. The
//! binary wires this up behind a small admin API.

pub mod api;
pub mod config;
pub mod identity;
pub mod ports;
pub mod readiness;
pub mod state;
pub mod workers;

pub use state::AppState;
