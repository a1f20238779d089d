//! Event hub types.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use procmux_core::config::HubSettings;

/// Hub-assigned client identifier, unique for the hub's lifetime.
pub type ClientId = u64;

/// A pre-encoded text frame, shared across every client it is fanned out to.
pub type Frame = Arc<str>;

/// Configuration for the event hub and its client pumps.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames queued per client before it is treated as dead.
    pub client_queue_capacity: usize,
    /// Pending publications awaiting fan-out.
    pub broadcast_capacity: usize,
    /// Pending membership commands.
    pub command_capacity: usize,
    /// Interval between WebSocket pings.
    pub ping_interval: Duration,
    /// Deadline for a single WebSocket write.
    pub write_timeout: Duration,
    /// Read deadline, refreshed on every pong.
    pub pong_timeout: Duration,
    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            client_queue_capacity: settings.client_queue_capacity.max(1),
            broadcast_capacity: settings.broadcast_capacity.max(1),
            command_capacity: settings.command_capacity.max(1),
            ping_interval: Duration::from_secs(settings.ping_interval_secs.max(1)),
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            pong_timeout: Duration::from_secs(settings.pong_timeout_secs),
            max_message_bytes: settings.max_message_bytes,
        }
    }
}

/// A registered client's end of the hub.
///
/// The queue closes when the hub drops the client, either on unregister,
/// on backpressure, or when the hub loop stops.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: ClientId,
    pub rx: mpsc::Receiver<Frame>,
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Connected clients.
    pub clients: usize,
    /// Channels with at least one subscriber.
    pub channels: usize,
}

/// Hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Hub publish queue is full")]
    QueueFull,

    #[error("Hub is not running")]
    Closed,
}
