//! One supervised OS process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use procmux_proto::ProcessStatus;

use crate::buffer::RingBuffer;

/// Reply channel for a forceful kill request, answered by the exit waiter.
pub(crate) type KillRequest = oneshot::Sender<std::io::Result<()>>;

/// Shared handle to a supervised process.
pub type ProcessHandle = Arc<Process>;

/// A spawned process with its captured output.
///
/// Immutable launch details live directly on the struct; everything the
/// background tasks mutate sits behind the per-process lock.
#[derive(Debug)]
pub struct Process {
    id: String,
    /// Launch order, used to keep listings stable.
    pub(crate) seq: u64,
    command: String,
    args: Vec<String>,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    output: Arc<RingBuffer>,
    /// Cancelled by `stop`; the exit waiter turns it into a termination request.
    pub(crate) cancel: CancellationToken,
    pub(crate) kill_tx: mpsc::Sender<KillRequest>,
    pub(crate) state: Mutex<ProcessState>,
}

#[derive(Debug)]
pub(crate) struct ProcessState {
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    /// Set while the OS process is live; cleared once its exit is observed.
    pub pid: Option<u32>,
    pub stdin_tx: Option<mpsc::Sender<String>>,
}

pub(crate) struct LaunchDetails {
    pub id: String,
    pub seq: u64,
    pub command: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub pid: Option<u32>,
    pub output: Arc<RingBuffer>,
    pub stdin_tx: Option<mpsc::Sender<String>>,
    pub kill_tx: mpsc::Sender<KillRequest>,
}

impl Process {
    pub(crate) fn running(details: LaunchDetails) -> Self {
        Self {
            id: details.id,
            seq: details.seq,
            command: details.command,
            args: details.args,
            dir: details.dir,
            started_at: Utc::now(),
            output: details.output,
            cancel: CancellationToken::new(),
            kill_tx: details.kill_tx,
            state: Mutex::new(ProcessState {
                status: ProcessStatus::Running,
                exit_code: None,
                pid: details.pid,
                stdin_tx: details.stdin_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn status(&self) -> ProcessStatus {
        self.state.lock().await.status
    }

    /// Captured output, oldest first.
    pub fn output(&self) -> String {
        self.output.to_string_lossy()
    }

    pub(crate) fn output_buffer(&self) -> &RingBuffer {
        &self.output
    }

    /// Point-in-time snapshot without the output.
    pub async fn info(&self) -> ProcessInfo {
        let state = self.state.lock().await;
        ProcessInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            dir: self.dir.clone(),
            started_at: self.started_at,
            status: state.status,
            exit_code: state.exit_code,
            pid: state.pid.unwrap_or(0),
        }
    }
}

/// Read-only process snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
    /// Only meaningful once the exit has been observed.
    pub exit_code: Option<i32>,
    /// OS PID, 0 when not (or no longer) known.
    pub pid: u32,
}

/// Captured output of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutput {
    pub id: String,
    pub output: String,
    pub length: usize,
}
