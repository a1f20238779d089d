//! Configuration resolution for procmux.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/procmux/settings.json`)
//! 3. Project config (`.procmux/settings.json`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files are merged key by key, so a project file that only sets
//! `hub.client_queue_capacity` keeps every other value from lower layers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete procmux configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub hub: HubSettings,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind_address: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 9876,
            log_level: "info".to_string(),
        }
    }
}

/// Process supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Captured output kept per process, in bytes.
    pub output_buffer_bytes: usize,
    /// Longest line forwarded as one output frame; longer lines are split.
    pub max_line_bytes: usize,
    /// How long the exit waiter lets output readers drain before publishing status.
    pub output_drain_timeout_ms: u64,
    /// Pending stdin writes per process.
    pub stdin_queue_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            output_buffer_bytes: 1024 * 1024, // 1 MiB
            max_line_bytes: 1024 * 1024,
            output_drain_timeout_ms: 500,
            stdin_queue_capacity: 32,
        }
    }
}

/// Event hub settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Outbound frames queued per client before it is treated as dead.
    pub client_queue_capacity: usize,
    /// Pending broadcast/channel publications.
    pub broadcast_capacity: usize,
    /// Pending membership commands.
    pub command_capacity: usize,
    pub ping_interval_secs: u64,
    pub write_timeout_secs: u64,
    pub pong_timeout_secs: u64,
    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
            broadcast_capacity: 256,
            command_capacity: 64,
            ping_interval_secs: 30,
            write_timeout_secs: 10,
            pong_timeout_secs: 60,
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(project_config_path);
    let mut config = load_layers(&[global, project].into_iter().flatten().collect::<Vec<_>>())?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the given config files (lowest priority first) over the defaults.
///
/// Missing files are skipped.
pub fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        if path.exists() {
            let overlay = load_config_file(path)?;
            merge_values(&mut merged, overlay);
        }
    }
    serde_json::from_value(merged).map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("procmux").join("settings.json"))
}

/// Project config file path for a directory.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".procmux").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `PROCMUX_*` overrides read through `lookup`.
///
/// Unparseable numeric values are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("PROCMUX_PORT").and_then(|v| v.parse().ok()) {
        config.daemon.port = n;
    }
    if let Some(val) = lookup("PROCMUX_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(n) = lookup("PROCMUX_OUTPUT_BUFFER_BYTES").and_then(|v| v.parse().ok()) {
        config.supervisor.output_buffer_bytes = n;
    }
    if let Some(n) = lookup("PROCMUX_CLIENT_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.hub.client_queue_capacity = n;
    }
}
