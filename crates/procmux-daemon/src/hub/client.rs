//! WebSocket client pumps.
//!
//! Each connection runs a read pump (control frames in) and a write pump
//! (hub frames and pings out). Whichever ends first tears the client down.

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use procmux_proto::{Message, Payload};

use super::event_hub::EventHub;
use super::types::{ClientId, Frame};

/// Serve one upgraded WebSocket until either side goes away.
pub async fn serve_client(socket: WebSocket, hub: EventHub) {
    let client = match hub.register().await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket connection");
            return;
        }
    };
    let id = client.id;
    let config = hub.config().clone();
    info!(client_id = id, "Client connected");

    let (sink, stream) = socket.split();
    let mut write = tokio::spawn(write_pump(
        sink,
        client.rx,
        id,
        config.ping_interval,
        config.write_timeout,
    ));
    let mut read = tokio::spawn(read_pump(stream, hub.clone(), id, config.pong_timeout));

    let read_ended = tokio::select! {
        _ = &mut write => false,
        _ = &mut read => true,
    };

    if let Err(e) = hub.unregister(id).await {
        debug!(client_id = id, error = %e, "Unregister after disconnect failed");
    }
    if read_ended {
        // The closed queue makes the write pump send a Close frame and exit.
        if tokio::time::timeout(config.write_timeout, &mut write).await.is_err() {
            write.abort();
        }
    } else {
        read.abort();
    }
    info!(client_id = id, "Client disconnected");
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Frame>,
    id: ClientId,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    let _ = tokio::time::timeout(write_timeout, sink.send(WsMessage::Close(None))).await;
                    break;
                };
                // Fold in whatever queued up meanwhile, one frame per line.
                let mut text = String::from(&*frame);
                while let Ok(next) = rx.try_recv() {
                    text.push('\n');
                    text.push_str(&next);
                }
                if !send_with_deadline(&mut sink, WsMessage::Text(text.into()), write_timeout, id).await {
                    break;
                }
            }
            _ = ping.tick() => {
                if !send_with_deadline(&mut sink, WsMessage::Ping(Bytes::new()), write_timeout, id).await {
                    break;
                }
            }
        }
    }
    debug!(client_id = id, "Write pump finished");
}

async fn send_with_deadline(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    message: WsMessage,
    deadline: Duration,
    id: ClientId,
) -> bool {
    match tokio::time::timeout(deadline, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(client_id = id, error = %e, "WebSocket write failed");
            false
        }
        Err(_) => {
            warn!(client_id = id, "WebSocket write timed out");
            false
        }
    }
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    hub: EventHub,
    id: ClientId,
    pong_timeout: Duration,
) {
    let mut deadline = Instant::now() + pong_timeout;
    loop {
        let message = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(client_id = id, error = %e, "WebSocket read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(client_id = id, "No pong before read deadline");
                break;
            }
        };
        match message {
            WsMessage::Text(text) => handle_control_frame(&hub, id, text.as_str()).await,
            WsMessage::Pong(_) => deadline = Instant::now() + pong_timeout,
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Binary(_) => {}
        }
    }
    debug!(client_id = id, "Read pump finished");
}

/// Apply a client control frame. Anything unparseable or unexpected is
/// dropped without telling the sender.
async fn handle_control_frame(hub: &EventHub, id: ClientId, text: &str) {
    let message = match Message::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(client_id = id, error = %e, "Ignoring malformed frame");
            return;
        }
    };
    let result = match message.payload {
        Payload::Subscribe(channel) => hub.subscribe(id, &channel).await,
        Payload::Unsubscribe(channel) => hub.unsubscribe(id, &channel).await,
        Payload::Ping => hub.send_to_client(id, Message::pong()),
        other => {
            debug!(client_id = id, kind = %other.message_type(), "Ignoring unexpected frame");
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!(client_id = id, error = %e, "Control frame not applied");
    }
}
