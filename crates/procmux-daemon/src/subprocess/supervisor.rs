//! Process supervisor.
//!
//! Spawns processes with piped stdio, captures their output into per-process
//! ring buffers, and reports output lines and exits through callbacks.
//!
//! Each process gets three background tasks:
//! - one line reader per output stream (stdout, stderr)
//! - a stdin writer fed by a bounded queue
//! - an exit waiter that owns the `Child`
//!
//! The exit waiter is the only place a status transition to `exited` or
//! `failed` happens, so each process produces exactly one status callback.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use procmux_core::config::SupervisorSettings;
use procmux_proto::ProcessStatus;

use super::error::SupervisorError;
use super::process::{
    KillRequest, LaunchDetails, Process, ProcessHandle, ProcessInfo, ProcessOutput,
};
use crate::buffer::RingBuffer;

/// Called once per captured line with `(process_id, line)`. The line keeps
/// its trailing newline.
pub type OutputCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Called once per process exit with `(process_id, status, exit_code)`.
pub type StatusCallback = Arc<dyn Fn(&str, ProcessStatus, Option<i32>) + Send + Sync>;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub output_buffer_bytes: usize,
    pub max_line_bytes: usize,
    pub output_drain_timeout: Duration,
    pub stdin_queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

impl From<&SupervisorSettings> for SupervisorConfig {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            output_buffer_bytes: settings.output_buffer_bytes,
            max_line_bytes: settings.max_line_bytes.max(1),
            output_drain_timeout: Duration::from_millis(settings.output_drain_timeout_ms),
            stdin_queue_capacity: settings.stdin_queue_capacity.max(1),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    on_output: RwLock<Option<OutputCallback>>,
    on_status: RwLock<Option<StatusCallback>>,
}

impl Callbacks {
    async fn output(&self, process_id: &str, line: &str) {
        let callback = self.on_output.read().await.clone();
        if let Some(callback) = callback {
            callback(process_id, line);
        }
    }

    async fn status(&self, process_id: &str, status: ProcessStatus, exit_code: Option<i32>) {
        let callback = self.on_status.read().await.clone();
        if let Some(callback) = callback {
            callback(process_id, status, exit_code);
        }
    }
}

/// Registry of supervised processes.
pub struct ProcessSupervisor {
    processes: RwLock<HashMap<String, ProcessHandle>>,
    next_id: AtomicU64,
    buffer_size: AtomicUsize,
    config: SupervisorConfig,
    callbacks: Arc<Callbacks>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            buffer_size: AtomicUsize::new(config.output_buffer_bytes),
            config,
            callbacks: Arc::new(Callbacks::default()),
        }
    }

    /// Output buffer capacity for processes started from now on.
    pub fn set_buffer_size(&self, bytes: usize) {
        self.buffer_size.store(bytes, Ordering::Relaxed);
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    /// Replace the output callback. Lines already being delivered may still
    /// reach the previous one.
    pub async fn on_output<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.callbacks.on_output.write().await = Some(Arc::new(callback));
    }

    pub async fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(&str, ProcessStatus, Option<i32>) + Send + Sync + 'static,
    {
        *self.callbacks.on_status.write().await = Some(Arc::new(callback));
    }

    /// Launch `command` with `args` in `dir` (the daemon's own working
    /// directory when empty).
    ///
    /// On success the process is registered as `running`. A launch failure
    /// registers nothing, though the ID counter still advances.
    pub async fn start(
        &self,
        command: &str,
        args: &[String],
        dir: impl AsRef<Path>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("proc-{seq}");

        let requested = dir.as_ref();
        let dir = if requested.as_os_str().is_empty() {
            std::env::current_dir().unwrap_or_default()
        } else {
            requested.to_path_buf()
        };

        let spawn_failed = |source: std::io::Error| SupervisorError::SpawnFailed {
            command: command.to_string(),
            source,
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            process_id = %id,
            command,
            ?args,
            dir = %dir.display(),
            "Starting process"
        );
        let mut child = cmd.spawn().map_err(|e| {
            warn!(process_id = %id, command, error = %e, "Failed to start process");
            spawn_failed(e)
        })?;

        // Dropping `child` on the error paths below kills it.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed(std::io::Error::other("failed to capture stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed(std::io::Error::other("failed to capture stderr")))?;
        let stdin_tx = child
            .stdin
            .take()
            .map(|stdin| spawn_stdin_writer(id.clone(), stdin, self.config.stdin_queue_capacity));

        let pid = child.id();
        let (kill_tx, kill_rx) = mpsc::channel::<KillRequest>(1);
        let process = Arc::new(Process::running(LaunchDetails {
            id: id.clone(),
            seq,
            command: command.to_string(),
            args: args.to_vec(),
            dir,
            pid,
            output: Arc::new(RingBuffer::new(self.buffer_size())),
            stdin_tx,
            kill_tx,
        }));

        // Register before any output can be reported, so callbacks never
        // see an ID that lookups cannot resolve.
        self.processes
            .write()
            .await
            .insert(id.clone(), Arc::clone(&process));

        let readers = vec![
            self.spawn_reader(&process, stdout, "stdout"),
            self.spawn_reader(&process, stderr, "stderr"),
        ];

        tokio::spawn(wait_for_exit(
            Arc::clone(&process),
            child,
            kill_rx,
            readers,
            self.config.output_drain_timeout,
            Arc::clone(&self.callbacks),
        ));

        info!(process_id = %id, ?pid, "Process started");
        Ok(process)
    }

    fn spawn_reader<R>(&self, process: &ProcessHandle, stream: R, name: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(read_lines(
            Arc::clone(process),
            stream,
            name,
            self.config.max_line_bytes,
            Arc::clone(&self.callbacks),
        ))
    }

    async fn lookup(&self, id: &str) -> Result<ProcessHandle, SupervisorError> {
        self.processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::not_found(id))
    }

    /// Request graceful termination.
    ///
    /// The status becomes `stopped` immediately and stays that way once the
    /// exit is observed; the exit code is still recorded.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let process = self.lookup(id).await?;
        let mut state = process.state.lock().await;
        if !state.status.is_running() {
            return Err(SupervisorError::NotRunning {
                id: id.to_string(),
                status: state.status,
            });
        }
        state.status = ProcessStatus::Stopped;
        drop(state);

        process.cancel.cancel();
        info!(process_id = %id, "Stop requested");
        Ok(())
    }

    /// Forcefully kill the OS process.
    ///
    /// Does not change the status; the exit waiter records the outcome.
    /// Fails with `NoPid` once the exit has been observed.
    pub async fn kill(&self, id: &str) -> Result<(), SupervisorError> {
        let process = self.lookup(id).await?;
        let no_pid = || SupervisorError::NoPid { id: id.to_string() };

        // The waiter takes this lock after its wait completes, so it must not
        // be held while waiting for the reply.
        let pid = process.state.lock().await.pid;
        let pid = pid.ok_or_else(no_pid)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        process.kill_tx.send(reply_tx).await.map_err(|_| no_pid())?;
        match reply_rx.await {
            Ok(Ok(())) => {
                info!(process_id = %id, pid, "Process killed");
                Ok(())
            }
            Ok(Err(source)) => Err(SupervisorError::KillFailed {
                id: id.to_string(),
                source,
            }),
            // Exit observed before the request was served.
            Err(_) => Err(no_pid()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<ProcessInfo, SupervisorError> {
        Ok(self.lookup(id).await?.info().await)
    }

    /// Snapshots of every registered process, in start order.
    pub async fn list(&self) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessHandle> =
            self.processes.read().await.values().cloned().collect();
        processes.sort_by_key(|p| p.seq);

        let mut infos = Vec::with_capacity(processes.len());
        for process in processes {
            infos.push(process.info().await);
        }
        infos
    }

    /// Captured output, oldest first.
    pub async fn output(&self, id: &str) -> Result<String, SupervisorError> {
        Ok(self.lookup(id).await?.output())
    }

    pub async fn output_info(&self, id: &str) -> Result<ProcessOutput, SupervisorError> {
        let process = self.lookup(id).await?;
        let output = process.output();
        Ok(ProcessOutput {
            id: id.to_string(),
            length: process.output_buffer().len(),
            output,
        })
    }

    /// Queue `text` for the process's stdin, verbatim.
    pub async fn send_input(&self, id: &str, text: &str) -> Result<(), SupervisorError> {
        let process = self.lookup(id).await?;
        let state = process.state.lock().await;
        if !state.status.is_running() {
            return Err(SupervisorError::NotRunning {
                id: id.to_string(),
                status: state.status,
            });
        }
        let stdin_tx = state
            .stdin_tx
            .clone()
            .ok_or_else(|| SupervisorError::StdinUnavailable { id: id.to_string() })?;
        drop(state);

        stdin_tx
            .send(text.to_string())
            .await
            .map_err(|_| SupervisorError::StdinUnavailable { id: id.to_string() })
    }

    /// Close the process's stdin once queued input has been written.
    pub async fn close_input(&self, id: &str) -> Result<(), SupervisorError> {
        let process = self.lookup(id).await?;
        let mut state = process.state.lock().await;
        if state.stdin_tx.take().is_none() {
            return Err(SupervisorError::StdinUnavailable { id: id.to_string() });
        }
        debug!(process_id = %id, "Stdin closed");
        Ok(())
    }

    /// Unregister a process whose OS process is gone.
    ///
    /// A stopped process that has not exited yet is refused too, so it stays
    /// reachable by `kill` and `kill_all`.
    pub async fn remove(&self, id: &str) -> Result<(), SupervisorError> {
        let mut processes = self.processes.write().await;
        let process = processes
            .get(id)
            .ok_or_else(|| SupervisorError::not_found(id))?;
        let state = process.state.lock().await;
        if state.status.is_running() || state.pid.is_some() {
            return Err(SupervisorError::StillRunning { id: id.to_string() });
        }
        drop(state);
        processes.remove(id);
        drop(processes);
        info!(process_id = %id, "Process removed");
        Ok(())
    }

    /// Kill every process that still has a live OS process. Used on shutdown.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        for id in ids {
            match self.kill(&id).await {
                Ok(()) | Err(SupervisorError::NoPid { .. } | SupervisorError::ProcessNotFound { .. }) => {}
                Err(e) => warn!(process_id = %id, error = %e, "Failed to kill process on shutdown"),
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.processes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processes.read().await.is_empty()
    }
}

fn spawn_stdin_writer(process_id: String, stdin: ChildStdin, capacity: usize) -> mpsc::Sender<String> {
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(capacity);
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(text) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                error!(process_id = %process_id, "Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!(process_id = %process_id, "Failed to flush stdin: {}", e);
                break;
            }
        }
        debug!(process_id = %process_id, "stdin writer finished");
    });
    stdin_tx
}

/// Read newline-delimited chunks until EOF, appending each to the process
/// buffer and reporting it through the output callback.
async fn read_lines<R>(
    process: ProcessHandle,
    stream: R,
    name: &'static str,
    max_line_bytes: usize,
    callbacks: Arc<Callbacks>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let limit = u64::try_from(max_line_bytes).unwrap_or(u64::MAX);
    loop {
        buf.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = normalize_line(&buf);
                process.output_buffer().write(line.as_bytes());
                callbacks.output(process.id(), &line).await;
            }
            Err(e) => {
                debug!(process_id = %process.id(), stream = name, error = %e, "Output read failed");
                break;
            }
        }
    }
    debug!(process_id = %process.id(), stream = name, "Output reader finished");
}

/// Decode lossily and end with exactly one `\n`, dropping a `\r` before it.
fn normalize_line(raw: &[u8]) -> String {
    let trimmed = raw.strip_suffix(b"\n").unwrap_or(raw);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    let mut line = String::from_utf8_lossy(trimmed).into_owned();
    line.push('\n');
    line
}

/// Own the child until it exits, serving stop and kill requests meanwhile,
/// then record the outcome and, once output has drained, fire the status
/// callback once.
async fn wait_for_exit(
    process: ProcessHandle,
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillRequest>,
    readers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
    callbacks: Arc<Callbacks>,
) {
    let cancel = process.cancel.clone();
    let mut terminate_sent = false;

    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            () = cancel.cancelled(), if !terminate_sent => {
                terminate_sent = true;
                request_termination(&mut child, process.id());
            }
            Some(reply) = kill_rx.recv() => {
                let _ = reply.send(child.start_kill());
            }
        }
    };

    // Pending kill requests see their reply dropped and report `NoPid`.
    kill_rx.close();
    while kill_rx.try_recv().is_ok() {}

    // Record the exit right away so stop, kill and input are refused from
    // here on, even while the output pipes stay open.
    let (status, exit_code) = {
        let mut state = process.state.lock().await;
        state.pid = None;
        state.stdin_tx = None;
        match &result {
            Ok(exit) => {
                state.exit_code = exit.code();
                if state.status.is_running() {
                    state.status = ProcessStatus::Exited;
                }
            }
            Err(_) => {
                if state.status.is_running() {
                    state.status = ProcessStatus::Failed;
                }
            }
        }
        (state.status, state.exit_code)
    };

    match result {
        Ok(exit) => info!(process_id = %process.id(), %status, ?exit_code, %exit, "Process exited"),
        Err(e) => warn!(process_id = %process.id(), %status, error = %e, "Error waiting for process"),
    }

    // Let the readers forward trailing output before the status goes out.
    // A grandchild holding the pipes open must not delay it forever.
    let drained = tokio::time::timeout(drain_timeout, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!(process_id = %process.id(), "Output still open after exit, not waiting further");
    }

    callbacks.status(process.id(), status, exit_code).await;
}

#[cfg(unix)]
fn request_termination(child: &mut Child, process_id: &str) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(process_id, pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, process_id: &str) {
    if let Err(e) = child.start_kill() {
        warn!(process_id, error = %e, "Failed to terminate process");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn normalize_line_handles_line_endings() {
        assert_eq!(normalize_line(b"hi\n"), "hi\n");
        assert_eq!(normalize_line(b"hi\r\n"), "hi\n");
        assert_eq!(normalize_line(b"partial"), "partial\n");
        assert_eq!(normalize_line(b"\xff\n"), "\u{fffd}\n");
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let supervisor = ProcessSupervisor::default();
        for result in [
            supervisor.stop("proc-404").await,
            supervisor.kill("proc-404").await,
            supervisor.send_input("proc-404", "x").await,
            supervisor.remove("proc-404").await,
        ] {
            assert!(matches!(result, Err(SupervisorError::ProcessNotFound { .. })));
        }
        assert!(supervisor.get("proc-404").await.is_err());
        assert!(supervisor.output("proc-404").await.is_err());
    }

    #[tokio::test]
    async fn launch_failure_registers_nothing_but_consumes_an_id() {
        let supervisor = ProcessSupervisor::default();
        let err = supervisor
            .start("/definitely/not/a/binary", &[], "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::subprocess::ErrorKind::Launch);
        assert!(supervisor.is_empty().await);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::sync::Mutex;

        async fn wait_until_not_running(supervisor: &ProcessSupervisor, id: &str) -> ProcessInfo {
            tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    let info = supervisor.get(id).await.unwrap();
                    if info.pid == 0 {
                        return info;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("process did not exit in time")
        }

        fn args(values: &[&str]) -> Vec<String> {
            values.iter().map(ToString::to_string).collect()
        }

        #[tokio::test]
        async fn ids_are_sequential_even_after_failure() {
            let supervisor = ProcessSupervisor::default();
            let first = supervisor.start("true", &[], "").await.unwrap();
            assert_eq!(first.id(), "proc-1");
            assert!(supervisor.start("/no/such/binary", &[], "").await.is_err());
            let third = supervisor.start("true", &[], "").await.unwrap();
            assert_eq!(third.id(), "proc-3");

            let ids: Vec<String> = supervisor.list().await.into_iter().map(|p| p.id).collect();
            assert_eq!(ids, ["proc-1", "proc-3"]);
        }

        #[tokio::test]
        async fn exit_fires_exactly_one_status_callback() {
            let supervisor = ProcessSupervisor::default();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            supervisor
                .on_status_change(move |id, status, code| {
                    sink.lock().unwrap().push((id.to_string(), status, code));
                })
                .await;

            let process = supervisor.start("true", &[], "").await.unwrap();
            let info = wait_until_not_running(&supervisor, process.id()).await;
            assert_eq!(info.status, ProcessStatus::Exited);
            assert_eq!(info.exit_code, Some(0));

            tokio::time::sleep(Duration::from_millis(100)).await;
            let seen = seen.lock().unwrap().clone();
            assert_eq!(seen, [("proc-1".to_string(), ProcessStatus::Exited, Some(0))]);
        }

        #[tokio::test]
        async fn output_is_buffered_and_reported_before_status() {
            let supervisor = ProcessSupervisor::default();
            let events = Arc::new(Mutex::new(Vec::new()));
            let out = Arc::clone(&events);
            supervisor
                .on_output(move |_, line| out.lock().unwrap().push(format!("out:{line}")))
                .await;
            let status = Arc::clone(&events);
            supervisor
                .on_status_change(move |_, s, _| status.lock().unwrap().push(format!("status:{s}")))
                .await;

            let process = supervisor
                .start("sh", &args(&["-c", "echo hi; echo oops >&2"]), "")
                .await
                .unwrap();
            wait_until_not_running(&supervisor, process.id()).await;
            tokio::time::sleep(Duration::from_millis(100)).await;

            let output = supervisor.output(process.id()).await.unwrap();
            assert!(output.contains("hi\n"));
            assert!(output.contains("oops\n"));

            let events = events.lock().unwrap().clone();
            assert_eq!(events.last().map(String::as_str), Some("status:exited"));
            assert_eq!(events.len(), 3);
        }

        #[tokio::test]
        async fn nonzero_exit_code_is_recorded() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor
                .start("sh", &args(&["-c", "exit 3"]), "")
                .await
                .unwrap();
            let info = wait_until_not_running(&supervisor, process.id()).await;
            assert_eq!(info.status, ProcessStatus::Exited);
            assert_eq!(info.exit_code, Some(3));
        }

        #[tokio::test]
        async fn kill_after_exit_reports_no_pid() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor.start("true", &[], "").await.unwrap();
            wait_until_not_running(&supervisor, process.id()).await;

            let err = supervisor.kill(process.id()).await.unwrap_err();
            assert!(matches!(err, SupervisorError::NoPid { .. }));
        }

        #[tokio::test]
        async fn kill_terminates_a_running_process() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor.start("sleep", &args(&["30"]), "").await.unwrap();
            supervisor.kill(process.id()).await.unwrap();

            let info = wait_until_not_running(&supervisor, process.id()).await;
            assert_eq!(info.status, ProcessStatus::Exited);
            assert_eq!(info.exit_code, None);
        }

        #[tokio::test]
        async fn stop_marks_stopped_and_terminates() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor.start("sleep", &args(&["30"]), "").await.unwrap();

            supervisor.stop(process.id()).await.unwrap();
            assert_eq!(process.status().await, ProcessStatus::Stopped);

            let info = wait_until_not_running(&supervisor, process.id()).await;
            assert_eq!(info.status, ProcessStatus::Stopped);

            let again = supervisor.stop(process.id()).await.unwrap_err();
            assert!(matches!(again, SupervisorError::NotRunning { .. }));
        }

        #[tokio::test]
        async fn input_reaches_stdin() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor.start("cat", &[], "").await.unwrap();

            supervisor.send_input(process.id(), "ping\n").await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), async {
                while !supervisor.output(process.id()).await.unwrap().contains("ping\n") {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("echoed input");

            supervisor.close_input(process.id()).await.unwrap();
            let info = wait_until_not_running(&supervisor, process.id()).await;
            assert_eq!(info.exit_code, Some(0));

            let err = supervisor.send_input(process.id(), "late\n").await.unwrap_err();
            assert!(matches!(err, SupervisorError::NotRunning { .. }));
        }

        #[tokio::test]
        async fn remove_requires_a_finished_process() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor.start("sleep", &args(&["30"]), "").await.unwrap();

            let err = supervisor.remove(process.id()).await.unwrap_err();
            assert!(matches!(err, SupervisorError::StillRunning { .. }));

            supervisor.kill(process.id()).await.unwrap();
            wait_until_not_running(&supervisor, process.id()).await;
            supervisor.remove(process.id()).await.unwrap();
            assert!(supervisor.get(process.id()).await.is_err());
        }

        #[tokio::test]
        async fn stopped_but_alive_process_cannot_be_removed() {
            let supervisor = ProcessSupervisor::default();
            let process = supervisor
                .start("sh", &args(&["-c", "trap '' TERM; exec sleep 30"]), "")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            supervisor.stop(process.id()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let info = supervisor.get(process.id()).await.unwrap();
            assert_eq!(info.status, ProcessStatus::Stopped);
            assert_ne!(info.pid, 0);

            let err = supervisor.remove(process.id()).await.unwrap_err();
            assert!(matches!(err, SupervisorError::StillRunning { .. }));

            supervisor.kill(process.id()).await.unwrap();
            wait_until_not_running(&supervisor, process.id()).await;
            supervisor.remove(process.id()).await.unwrap();
        }

        #[tokio::test]
        async fn exit_is_recorded_while_a_grandchild_holds_the_pipes() {
            let config = SupervisorConfig {
                output_drain_timeout: Duration::from_secs(10),
                ..SupervisorConfig::default()
            };
            let supervisor = ProcessSupervisor::new(config);
            let statuses = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&statuses);
            supervisor
                .on_status_change(move |_, status, _| sink.lock().unwrap().push(status))
                .await;

            let process = supervisor
                .start("sh", &args(&["-c", "sleep 3 & exit 0"]), "")
                .await
                .unwrap();

            // Well inside the drain window: the exit must already be visible.
            let info = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let info = supervisor.get(process.id()).await.unwrap();
                    if info.pid == 0 {
                        return info;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .expect("exit not recorded while output was still open");
            assert_eq!(info.status, ProcessStatus::Exited);
            assert_eq!(info.exit_code, Some(0));

            let kill = supervisor.kill(process.id()).await.unwrap_err();
            assert!(matches!(kill, SupervisorError::NoPid { .. }));
            let stop = supervisor.stop(process.id()).await.unwrap_err();
            assert!(matches!(stop, SupervisorError::NotRunning { .. }));
            let input = supervisor.send_input(process.id(), "x\n").await.unwrap_err();
            assert!(matches!(input, SupervisorError::NotRunning { .. }));

            // The callback still waits for the output to drain.
            assert!(statuses.lock().unwrap().is_empty());
            assert_eq!(process.status().await, ProcessStatus::Exited);
        }

        #[tokio::test]
        async fn buffer_size_applies_to_new_processes() {
            let supervisor = ProcessSupervisor::default();
            supervisor.set_buffer_size(4);
            let process = supervisor
                .start("sh", &args(&["-c", "printf 'abcdefgh\\n'"]), "")
                .await
                .unwrap();
            wait_until_not_running(&supervisor, process.id()).await;

            let output = supervisor.output_info(process.id()).await.unwrap();
            assert_eq!(output.output, "fgh\n");
            assert_eq!(output.length, 4);
        }

        #[tokio::test]
        async fn working_directory_is_honoured() {
            let dir = tempfile::tempdir().unwrap();
            let supervisor = ProcessSupervisor::default();
            let process = supervisor.start("pwd", &[], dir.path()).await.unwrap();
            wait_until_not_running(&supervisor, process.id()).await;

            let output = supervisor.output(process.id()).await.unwrap();
            let reported = std::fs::canonicalize(output.trim()).unwrap();
            assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
        }
    }
}
