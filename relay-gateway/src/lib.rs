//! The HTTP/WebSocket front door for `relay_core::Gateway`.
//!
//! Split into a library and a thin binary (`src/main.rs`) the way `dwctl` is,
//! so the router and config layers are exercisable from integration tests
//! without spawning a real TCP listener.

pub mod api;
pub mod config;
pub mod telemetry;
