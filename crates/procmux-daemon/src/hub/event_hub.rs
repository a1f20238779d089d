//! Event hub: channel-based fan-out to connected clients.
//!
//! All membership state (clients, channel subscribers) is owned by a single
//! control loop, [`HubLoop`]. [`EventHub`] handles talk to it over two
//! bounded queues: acknowledged membership commands, and fire-and-forget
//! publications. Per-client delivery is a non-blocking enqueue; a client
//! whose queue is full is dropped rather than allowed to stall the loop.
//!
//! The loop also mirrors the set of channels that have subscribers into a
//! `watch` channel, so channel sends with no audience never reach the shared
//! publication queue.
//!
//! Commands are served ahead of publications. A subscription acknowledged
//! while older publications are still queued may therefore receive them:
//! ordering is only guaranteed for publications made after the ack.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use procmux_proto::{Message, ProcessStatus, channels};

use super::types::{ClientHandle, ClientId, Frame, HubConfig, HubError, HubStats};

enum Command {
    Register {
        id: ClientId,
        tx: mpsc::Sender<Frame>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ClientId,
        ack: oneshot::Sender<()>,
    },
    Subscribe {
        id: ClientId,
        channel: String,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe {
        id: ClientId,
        channel: String,
        ack: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

enum Delivery {
    Broadcast(Frame),
    Channel(String, Frame),
    Client(ClientId, Frame),
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::Sender<Command>,
    publications: mpsc::Sender<Delivery>,
    active_channels: watch::Receiver<HashSet<String>>,
    next_client_id: Arc<AtomicU64>,
    config: Arc<HubConfig>,
}

/// The hub's control loop. Drive it with [`HubLoop::run`].
pub struct HubLoop {
    commands: mpsc::Receiver<Command>,
    publications: mpsc::Receiver<Delivery>,
    clients: HashMap<ClientId, ClientEntry>,
    channels: HashMap<String, HashSet<ClientId>>,
    active_channels: watch::Sender<HashSet<String>>,
}

struct ClientEntry {
    tx: mpsc::Sender<Frame>,
    subscriptions: HashSet<String>,
}

impl EventHub {
    /// Create a hub handle and the loop that must be spawned to serve it.
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (publish_tx, publish_rx) = mpsc::channel(config.broadcast_capacity);
        let (active_tx, active_rx) = watch::channel(HashSet::new());
        let hub = Self {
            commands: command_tx,
            publications: publish_tx,
            active_channels: active_rx,
            next_client_id: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        };
        let hub_loop = HubLoop {
            commands: command_rx,
            publications: publish_rx,
            clients: HashMap::new(),
            channels: HashMap::new(),
            active_channels: active_tx,
        };
        (hub, hub_loop)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Register a new client and return its outbound queue.
    pub async fn register(&self) -> Result<ClientHandle, HubError> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.client_queue_capacity);
        self.command(|ack| Command::Register { id, tx, ack }).await?;
        Ok(ClientHandle { id, rx })
    }

    /// Drop a client and all its subscriptions. Unknown IDs are ignored.
    pub async fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.command(|ack| Command::Unregister { id, ack }).await
    }

    /// Subscribe a client to `channel`.
    ///
    /// Takes effect before this returns: any publication made afterwards is
    /// delivered to the client.
    pub async fn subscribe(&self, id: ClientId, channel: &str) -> Result<(), HubError> {
        let channel = channel.to_string();
        self.command(|ack| Command::Subscribe { id, channel, ack })
            .await
    }

    /// Unsubscribe a client from `channel`. No publication made after this
    /// returns reaches the client through that channel.
    pub async fn unsubscribe(&self, id: ClientId, channel: &str) -> Result<(), HubError> {
        let channel = channel.to_string();
        self.command(|ack| Command::Unsubscribe { id, channel, ack })
            .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.command(|reply| Command::Stats { reply }).await
    }

    /// Send to every connected client.
    pub fn broadcast(&self, message: Message) -> Result<(), HubError> {
        let frame = encode(message)?;
        self.publish(Delivery::Broadcast(frame))
    }

    /// Send to the current subscribers of `channel`; a no-op when it has none.
    pub fn send_to_channel(&self, channel: &str, message: Message) -> Result<(), HubError> {
        if channel.is_empty() || !self.has_subscribers(channel) {
            return Ok(());
        }
        let frame = encode(message.with_channel(channel))?;
        self.publish(Delivery::Channel(channel.to_string(), frame))
    }

    /// Send to a single client.
    pub fn send_to_client(&self, id: ClientId, message: Message) -> Result<(), HubError> {
        let frame = encode(message)?;
        self.publish(Delivery::Client(id, frame))
    }

    /// Publish one line of process output on `process:<id>`.
    pub fn send_process_output(&self, process_id: &str, line: &str) -> Result<(), HubError> {
        self.send_to_channel(
            &channels::process(process_id),
            Message::process_output(process_id, line),
        )
    }

    /// Publish a process status change on `process:<id>`.
    pub fn send_process_status(
        &self,
        process_id: &str,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Result<(), HubError> {
        self.send_to_channel(
            &channels::process(process_id),
            Message::process_status(process_id, status, exit_code),
        )
    }

    /// Whether `channel` currently has at least one subscriber.
    pub fn has_subscribers(&self, channel: &str) -> bool {
        self.active_channels.borrow().contains(channel)
    }

    fn publish(&self, delivery: Delivery) -> Result<(), HubError> {
        self.publications.try_send(delivery).map_err(|e| match e {
            TrySendError::Full(_) => HubError::QueueFull,
            TrySendError::Closed(_) => HubError::Closed,
        })
    }
}

/// Stamp and encode once; the frame is shared by every recipient.
fn encode(mut message: Message) -> Result<Frame, HubError> {
    message.timestamp = Utc::now();
    Ok(Arc::from(message.to_json()?))
}

impl HubLoop {
    /// Serve commands and publications until `shutdown` is cancelled or every
    /// [`EventHub`] handle is dropped. On exit all client queues are closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Event hub started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(delivery) = self.publications.recv() => self.deliver(delivery),
                else => break,
            }
        }
        let clients = self.clients.len();
        self.clients.clear();
        self.channels.clear();
        self.active_channels.send_modify(HashSet::clear);
        info!(clients, "Event hub stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { id, tx, ack } => {
                self.clients.insert(
                    id,
                    ClientEntry {
                        tx,
                        subscriptions: HashSet::new(),
                    },
                );
                info!(client_id = id, clients = self.clients.len(), "Client registered");
                let _ = ack.send(());
            }
            Command::Unregister { id, ack } => {
                if self.remove_client(id) {
                    info!(client_id = id, clients = self.clients.len(), "Client unregistered");
                }
                let _ = ack.send(());
            }
            Command::Subscribe { id, channel, ack } => {
                self.subscribe(id, channel);
                let _ = ack.send(());
            }
            Command::Unsubscribe { id, channel, ack } => {
                self.unsubscribe(id, &channel);
                let _ = ack.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(HubStats {
                    clients: self.clients.len(),
                    channels: self.channels.len(),
                });
            }
        }
    }

    fn subscribe(&mut self, id: ClientId, channel: String) {
        if channel.is_empty() {
            return;
        }
        let Some(client) = self.clients.get_mut(&id) else {
            debug!(client_id = id, channel, "Subscribe from unknown client ignored");
            return;
        };
        if client.subscriptions.insert(channel.clone()) {
            debug!(client_id = id, channel, "Client subscribed");
            if !self.channels.contains_key(&channel) {
                self.active_channels.send_modify(|active| {
                    active.insert(channel.clone());
                });
            }
            self.channels.entry(channel).or_default().insert(id);
        }
    }

    fn unsubscribe(&mut self, id: ClientId, channel: &str) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.subscriptions.remove(channel) {
            debug!(client_id = id, channel, "Client unsubscribed");
            self.detach(id, channel);
        }
    }

    /// Remove `id` from a channel's subscriber set, pruning empty channels.
    fn detach(&mut self, id: ClientId, channel: &str) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.channels.remove(channel);
                self.active_channels.send_modify(|active| {
                    active.remove(channel);
                });
            }
        }
    }

    /// Drop a client, closing its queue. Returns whether it was registered.
    fn remove_client(&mut self, id: ClientId) -> bool {
        let Some(client) = self.clients.remove(&id) else {
            return false;
        };
        for channel in &client.subscriptions {
            self.detach(id, channel);
        }
        true
    }

    fn deliver(&mut self, delivery: Delivery) {
        let mut dead = Vec::new();
        match delivery {
            Delivery::Broadcast(frame) => {
                for (&id, client) in &self.clients {
                    if !enqueue(id, client, &frame) {
                        dead.push(id);
                    }
                }
            }
            Delivery::Channel(channel, frame) => {
                let Some(subscribers) = self.channels.get(&channel) else {
                    return;
                };
                for id in subscribers {
                    if let Some(client) = self.clients.get(id)
                        && !enqueue(*id, client, &frame)
                    {
                        dead.push(*id);
                    }
                }
            }
            Delivery::Client(id, frame) => {
                if let Some(client) = self.clients.get(&id)
                    && !enqueue(id, client, &frame)
                {
                    dead.push(id);
                }
            }
        }
        for id in dead {
            self.remove_client(id);
        }
    }
}

/// Non-blocking enqueue. Returns `false` if the client must be dropped.
fn enqueue(id: ClientId, client: &ClientEntry, frame: &Frame) -> bool {
    match client.tx.try_send(Arc::clone(frame)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(client_id = id, "Client queue full, disconnecting slow consumer");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(client_id = id, "Client queue closed");
            false
        }
    }
}
