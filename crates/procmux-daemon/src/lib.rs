//! procmux daemon library
//!
//! - Process supervision with bounded output capture
//! - Event hub fanning messages out to WebSocket clients by channel
//! - Bridge publishing process output and exits to the hub
//! - HTTP API and WebSocket endpoint

pub mod bridge;
pub mod buffer;
pub mod hub;
pub mod server;
pub mod subprocess;
