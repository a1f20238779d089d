//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use procmux_core::Config;

use crate::hub::HubConfig;
use crate::subprocess::SupervisorConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address.
    pub addr: SocketAddr,

    /// Event hub and client pump settings.
    pub hub: HubConfig,

    /// Process supervisor settings.
    pub supervisor: SupervisorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9876))
    }
}

impl ServerConfig {
    /// Create a server config listening on `addr` with default tuning.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            hub: HubConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }

    /// Build from resolved settings. Falls back to localhost when the
    /// configured bind address does not parse.
    pub fn from_config(config: &Config) -> Self {
        let ip = config
            .daemon
            .bind_address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self {
            addr: SocketAddr::new(ip, config.daemon.port),
            hub: HubConfig::from(&config.hub),
            supervisor: SupervisorConfig::from(&config.supervisor),
        }
    }

    #[must_use]
    pub const fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set the per-process output buffer size.
    #[must_use]
    pub const fn with_output_buffer_bytes(mut self, bytes: usize) -> Self {
        self.supervisor.output_buffer_bytes = bytes;
        self
    }

    /// Set the per-client outbound queue capacity.
    #[must_use]
    pub const fn with_client_queue_capacity(mut self, capacity: usize) -> Self {
        self.hub.client_queue_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }
}
