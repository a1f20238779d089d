//! HTTP/WebSocket server for the procmux daemon.

mod config;
mod routes;

pub use config::ServerConfig;
pub use routes::{ApiError, AppState, InputRequest, StartRequest, router};

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge;
use crate::hub::EventHub;
use crate::subprocess::ProcessSupervisor;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The daemon's components, wired together: hub loop, supervisor, bridge.
pub struct DaemonServer {
    config: ServerConfig,
    hub: EventHub,
    supervisor: Arc<ProcessSupervisor>,
    hub_shutdown: CancellationToken,
    hub_task: JoinHandle<()>,
}

impl DaemonServer {
    /// Spawn the hub loop and attach the supervisor to it.
    pub async fn new(config: ServerConfig) -> Self {
        let (hub, hub_loop) = EventHub::new(config.hub.clone());
        let hub_shutdown = CancellationToken::new();
        let hub_task = tokio::spawn(hub_loop.run(hub_shutdown.clone()));

        let supervisor = Arc::new(ProcessSupervisor::new(config.supervisor.clone()));
        bridge::attach(&supervisor, hub.clone()).await;

        Self {
            config,
            hub,
            supervisor,
            hub_shutdown,
            hub_task,
        }
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub const fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub const fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn router(&self) -> axum::Router {
        router(AppState {
            hub: self.hub.clone(),
            supervisor: Arc::clone(&self.supervisor),
        })
    }

    /// Serve on `listener` until `signal` resolves, then shut down: stop the
    /// hub (closing every WebSocket) and kill all running processes.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, "Starting HTTP server");

        // Open WebSockets would hold graceful shutdown forever, so the hub
        // goes down first and takes its clients with it.
        let hub_shutdown = self.hub_shutdown.clone();
        let shutdown = async move {
            signal.await;
            info!("Shutting down event hub");
            hub_shutdown.cancel();
        };

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        self.hub_shutdown.cancel();
        self.supervisor.kill_all().await;
        if let Err(e) = self.hub_task.await {
            warn!(error = %e, "Event hub task failed");
        }
        info!("Server stopped");
        result.map_err(ServerError::from)
    }
}
