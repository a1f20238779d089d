//! Pub/sub event hub and its WebSocket clients.

mod client;
mod event_hub;
mod types;

pub use client::serve_client;
pub use event_hub::{EventHub, HubLoop};
pub use types::{ClientHandle, ClientId, Frame, HubConfig, HubError, HubStats};
