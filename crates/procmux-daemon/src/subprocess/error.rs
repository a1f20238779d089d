//! Supervisor error types.

use procmux_proto::ProcessStatus;

/// Broad error class, for callers that map errors onto a transport
/// (HTTP status codes, tool results).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The OS process could not be launched; nothing was registered.
    Launch,
    /// No process with the given ID.
    NotFound,
    /// The process exists but the operation does not apply to its state.
    InvalidState,
}

/// Errors from process supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to start process {command}: {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("Process not found: {id}")]
    ProcessNotFound { id: String },

    #[error("Process {id} is not running (status: {status})")]
    NotRunning { id: String, status: ProcessStatus },

    #[error("Process {id} has no PID")]
    NoPid { id: String },

    #[error("Cannot remove running process: {id}")]
    StillRunning { id: String },

    #[error("Stdin not available for process {id}")]
    StdinUnavailable { id: String },

    #[error("Failed to kill process {id}: {source}")]
    KillFailed {
        id: String,
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed { .. } => ErrorKind::Launch,
            Self::ProcessNotFound { .. } => ErrorKind::NotFound,
            Self::NotRunning { .. }
            | Self::NoPid { .. }
            | Self::StillRunning { .. }
            | Self::StdinUnavailable { .. }
            | Self::KillFailed { .. } => ErrorKind::InvalidState,
        }
    }

    pub(crate) fn not_found(id: &str) -> Self {
        Self::ProcessNotFound { id: id.to_string() }
    }
}
