//! WebSocket round trips against a live daemon server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use procmux_daemon::hub::{EventHub, HubConfig};
use procmux_daemon::server::{DaemonServer, ServerConfig, ServerError};
use procmux_daemon::subprocess::ProcessSupervisor;
use procmux_proto::{Message, MessageType, Payload, ProcessStatus, StatusPayload};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestDaemon {
    addr: SocketAddr,
    hub: EventHub,
    supervisor: Arc<ProcessSupervisor>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

async fn start_daemon() -> TestDaemon {
    start_daemon_with(HubConfig::default()).await
}

async fn start_daemon_with(hub: HubConfig) -> TestDaemon {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = ServerConfig::tcp(addr);
    config.hub = hub;
    let server = DaemonServer::new(config).await;
    let hub = server.hub().clone();
    let supervisor = Arc::clone(server.supervisor());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(server.serve(listener, async move { signal.cancelled().await }));

    TestDaemon {
        addr,
        hub,
        supervisor,
        shutdown,
        task,
    }
}

async fn connect(addr: SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: &str) {
    socket.send(WsMessage::Text(frame.to_string())).await.unwrap();
}

/// Next hub messages. A single text frame may carry several, one per line.
async fn next_messages(socket: &mut Socket) -> Vec<Message> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return text
                .lines()
                .map(|line| Message::from_json(line).unwrap())
                .collect();
        }
    }
}

/// Ping and wait for the pong. Control frames are handled in order, so any
/// frame sent before this has been applied once it returns.
async fn sync(socket: &mut Socket) {
    send(socket, r#"{"type":"ping"}"#).await;
    loop {
        if next_messages(socket)
            .await
            .iter()
            .any(|m| m.message_type() == MessageType::Pong)
        {
            return;
        }
    }
}

#[tokio::test]
async fn ping_gets_pong_and_malformed_frames_are_ignored() {
    let daemon = start_daemon().await;
    let mut socket = connect(daemon.addr).await;

    send(&mut socket, "not json at all").await;
    send(&mut socket, r#"{"type":"subscribe","data":42}"#).await;
    send(&mut socket, r#"{"type":"bogus"}"#).await;

    send(&mut socket, r#"{"type":"ping","timestamp":"2024-01-01T00:00:00Z"}"#).await;
    let messages = next_messages(&mut socket).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, Payload::Pong);

    let stats = daemon.hub.stats().await.unwrap();
    assert_eq!(stats.clients, 1);
    assert_eq!(stats.channels, 0);

    daemon.shutdown.cancel();
    daemon.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn subscriptions_scope_channel_delivery() {
    let daemon = start_daemon().await;
    let mut subscriber = connect(daemon.addr).await;
    let mut bystander = connect(daemon.addr).await;

    send(&mut subscriber, r#"{"type":"subscribe","data":"builds"}"#).await;
    sync(&mut subscriber).await;
    sync(&mut bystander).await;

    daemon
        .hub
        .send_to_channel("builds", Message::event(serde_json::json!({"ok": true})))
        .unwrap();
    daemon
        .hub
        .broadcast(Message::event(serde_json::json!("everyone")))
        .unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        received.extend(next_messages(&mut subscriber).await);
    }
    assert_eq!(received[0].channel.as_deref(), Some("builds"));
    assert_eq!(received[1].payload, Payload::Event(serde_json::json!("everyone")));

    let seen = next_messages(&mut bystander).await;
    assert_eq!(seen[0].payload, Payload::Event(serde_json::json!("everyone")));

    send(&mut subscriber, r#"{"type":"unsubscribe","data":"builds"}"#).await;
    sync(&mut subscriber).await;
    assert_eq!(daemon.hub.stats().await.unwrap().channels, 0);

    daemon.shutdown.cancel();
    daemon.task.await.unwrap().unwrap();
}

async fn wait_for_clients(hub: &EventHub, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.stats().await.unwrap().clients != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client count never reached {expected}"));
}

#[tokio::test]
async fn clients_are_pinged_and_dropped_when_pongs_stop() {
    let daemon = start_daemon_with(HubConfig {
        ping_interval: Duration::from_millis(300),
        pong_timeout: Duration::from_secs(1),
        ..HubConfig::default()
    })
    .await;

    // Never polled, so its pings go unanswered.
    let _silent = connect(daemon.addr).await;
    let mut responsive = connect(daemon.addr).await;
    wait_for_clients(&daemon.hub, 2).await;

    // Reading answers pings automatically; keep at it well past the deadline.
    let mut pings = 0;
    let until = tokio::time::Instant::now() + Duration::from_millis(2500);
    while let Ok(frame) = tokio::time::timeout_at(until, responsive.next()).await {
        if let WsMessage::Ping(_) = frame.expect("socket closed").unwrap() {
            pings += 1;
        }
    }
    assert!(pings >= 2, "expected periodic pings, got {pings}");

    wait_for_clients(&daemon.hub, 1).await;
    sync(&mut responsive).await;
    assert_eq!(daemon.hub.stats().await.unwrap().clients, 1);

    daemon.shutdown.cancel();
    daemon.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_closes_client_connections() {
    let daemon = start_daemon().await;
    let mut socket = connect(daemon.addr).await;
    sync(&mut socket).await;

    daemon.shutdown.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client was not disconnected");
    daemon.task.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn process_output_and_status_stream_to_subscribers() {
    let daemon = start_daemon().await;
    let mut socket = connect(daemon.addr).await;

    send(&mut socket, r#"{"type":"subscribe","data":"process:proc-1"}"#).await;
    sync(&mut socket).await;

    let args = ["-c".to_string(), "echo hello; echo world".to_string()];
    let process = daemon.supervisor.start("sh", &args, "").await.unwrap();
    assert_eq!(process.id(), "proc-1");

    let mut received = Vec::new();
    while !received
        .iter()
        .any(|m: &Message| m.message_type() == MessageType::ProcessStatus)
    {
        received.extend(next_messages(&mut socket).await);
    }

    let lines: Vec<&Payload> = received
        .iter()
        .filter(|m| m.message_type() == MessageType::ProcessOutput)
        .map(|m| &m.payload)
        .collect();
    assert_eq!(
        lines,
        [
            &Payload::ProcessOutput("hello\n".into()),
            &Payload::ProcessOutput("world\n".into()),
        ]
    );

    let status = received.last().unwrap();
    assert_eq!(status.process_id.as_deref(), Some("proc-1"));
    assert_eq!(status.channel.as_deref(), Some("process:proc-1"));
    assert_eq!(
        status.payload,
        Payload::ProcessStatus(StatusPayload {
            status: ProcessStatus::Exited,
            exit_code: Some(0),
        })
    );

    daemon.shutdown.cancel();
    daemon.task.await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_kills_running_processes() {
    let daemon = start_daemon().await;
    let args = ["30".to_string()];
    let process = daemon.supervisor.start("sleep", &args, "").await.unwrap();

    daemon.shutdown.cancel();
    daemon.task.await.unwrap().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while daemon.supervisor.get(process.id()).await.unwrap().pid != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("process survived shutdown");
}
