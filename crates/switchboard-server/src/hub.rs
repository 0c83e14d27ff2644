//! Connection hub.
//!
//! A single task owns every live connection and processes registration,
//! removal, direct sends, broadcasts and inbound frames strictly in the order
//! they arrive on its event channel. The loop never awaits a peer: every
//! delivery is a `try_send`, and a connection whose queue is full is evicted.

use std::collections::{HashMap, HashSet};

use switchboard_core::messages::{JOIN, SDP_OFFER_ANSWER};
use switchboard_core::{ConnectionId, CoordinatorError, Envelope};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A client command decoded from an inbound frame, waiting to be executed.
#[derive(Clone, Debug)]
pub struct Command {
    pub sender: ConnectionId,
    pub kind: String,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, Default)]
pub struct BroadcastMessage {
    pub message: String,
    /// When non-empty, only these connections receive the message.
    pub include: Vec<ConnectionId>,
    /// Ignored when `include` is non-empty.
    pub exclude: Vec<ConnectionId>,
}

pub enum HubEvent {
    Register {
        outbound: mpsc::Sender<String>,
        messages: mpsc::Sender<Envelope>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Unregister(ConnectionId),
    Broadcast(BroadcastMessage),
    Send {
        id: ConnectionId,
        envelope: Envelope,
    },
    Received {
        sender: ConnectionId,
        raw: String,
    },
    Count(oneshot::Sender<usize>),
}

struct ConnectionEntry {
    outbound: mpsc::Sender<String>,
    messages: mpsc::Sender<Envelope>,
}

pub struct Hub {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    next_id: u64,
    events: mpsc::Receiver<HubEvent>,
    commands: mpsc::Sender<Command>,
    command_types: HashSet<String>,
    disconnects: Option<mpsc::UnboundedSender<ConnectionId>>,
}

/// Cloneable front door to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    /// Returns the hub, a handle to it, and the receiving end of the command
    /// queue (capacity `command_queue`).
    pub fn new(event_queue: usize, command_queue: usize) -> (Self, HubHandle, mpsc::Receiver<Command>) {
        let (event_tx, event_rx) = mpsc::channel(event_queue);
        let (command_tx, command_rx) = mpsc::channel(command_queue);
        let hub = Self {
            connections: HashMap::new(),
            next_id: 0,
            events: event_rx,
            commands: command_tx,
            command_types: [JOIN, SDP_OFFER_ANSWER].into_iter().map(String::from).collect(),
            disconnects: None,
        };
        (hub, HubHandle { events: event_tx }, command_rx)
    }

    /// Override the set of message types accepted as commands.
    pub fn with_command_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Receive the id of every connection after it has been removed.
    pub fn with_disconnect_listener(mut self, tx: mpsc::UnboundedSender<ConnectionId>) -> Self {
        self.disconnects = Some(tx);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
        let remaining = self.connections.len();
        self.connections.clear();
        info!(remaining, "hub stopped");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register { outbound, messages, reply } => {
                let id = self.register(outbound, messages);
                if reply.send(id).is_err() {
                    // The connection went away before learning its id.
                    self.remove(id);
                }
            }
            HubEvent::Unregister(id) => self.remove(id),
            HubEvent::Broadcast(msg) => self.broadcast(msg),
            HubEvent::Send { id, envelope } => self.send(id, envelope),
            HubEvent::Received { sender, raw } => self.dispatch(sender, &raw),
            HubEvent::Count(reply) => {
                let _ = reply.send(self.connections.len());
            }
        }
    }

    fn register(&mut self, outbound: mpsc::Sender<String>, messages: mpsc::Sender<Envelope>) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(id, ConnectionEntry { outbound, messages });
        info!(connection_id = id.get(), total = self.connections.len(), "client connected");
        self.send(id, Envelope::welcome(id));
        id
    }

    /// Dropping the entry drops both senders, which closes the queues.
    fn remove(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_none() {
            return;
        }
        info!(connection_id = id.get(), total = self.connections.len(), "client disconnected");
        if let Some(tx) = &self.disconnects {
            let _ = tx.send(id);
        }
    }

    fn broadcast(&mut self, msg: BroadcastMessage) {
        let targets: Vec<ConnectionId> = if msg.include.is_empty() {
            self.connections
                .keys()
                .copied()
                .filter(|id| !msg.exclude.contains(id))
                .collect()
        } else {
            msg.include
                .iter()
                .copied()
                .filter(|id| self.connections.contains_key(id))
                .collect()
        };

        let mut evicted = Vec::new();
        for id in targets {
            if let Some(entry) = self.connections.get(&id) {
                if let Err(e) = entry.outbound.try_send(msg.message.clone()) {
                    warn!(connection_id = id.get(), reason = %e, "outbound queue unavailable, evicting");
                    evicted.push(id);
                }
            }
        }
        for id in evicted {
            self.remove(id);
        }
    }

    fn send(&mut self, id: ConnectionId, envelope: Envelope) {
        let Some(entry) = self.connections.get(&id) else {
            debug!(connection_id = id.get(), kind = %envelope.kind, "send to unknown connection dropped");
            return;
        };
        if let Err(e) = entry.messages.try_send(envelope) {
            warn!(connection_id = id.get(), reason = %e, "message queue unavailable, evicting");
            self.remove(id);
        }
    }

    fn dispatch(&mut self, sender: ConnectionId, raw: &str) {
        let command = match self.decode(sender, raw) {
            Ok(command) => command,
            Err(e) => {
                warn!(connection_id = sender.get(), error = %e, kind = e.error_kind(), "dropping inbound message");
                return;
            }
        };
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(connection_id = sender.get(), kind = %cmd.kind, "command queue full");
                self.send(sender, Envelope::error("server is busy, try again"));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(connection_id = sender.get(), "command executor gone");
            }
        }
    }

    fn decode(&self, sender: ConnectionId, raw: &str) -> Result<Command, CoordinatorError> {
        let text = normalize(raw);
        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| CoordinatorError::InvalidMessage(e.to_string()))?;
        if !self.command_types.contains(&envelope.kind) {
            return Err(CoordinatorError::UnknownMessageType(envelope.kind));
        }
        Ok(Command {
            sender,
            kind: envelope.kind,
            data: envelope.data,
        })
    }
}

/// Newlines become spaces and surrounding whitespace is trimmed.
pub fn normalize(raw: &str) -> String {
    raw.replace(['\r', '\n'], " ").trim().to_string()
}

impl HubHandle {
    /// `None` when the hub has stopped.
    pub async fn register(
        &self,
        outbound: mpsc::Sender<String>,
        messages: mpsc::Sender<Envelope>,
    ) -> Option<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Register { outbound, messages, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.events.send(HubEvent::Unregister(id)).await;
    }

    pub async fn broadcast(&self, msg: BroadcastMessage) {
        let _ = self.events.send(HubEvent::Broadcast(msg)).await;
    }

    pub async fn send(&self, id: ConnectionId, envelope: Envelope) {
        let _ = self.events.send(HubEvent::Send { id, envelope }).await;
    }

    pub async fn received(&self, sender: ConnectionId, raw: String) {
        let _ = self.events.send(HubEvent::Received { sender, raw }).await;
    }

    pub async fn connection_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.events.send(HubEvent::Count(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
