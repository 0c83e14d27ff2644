//! One client WebSocket: a writer pump draining the connection's queues and
//! a reader pump feeding the hub, with ping/pong keepalive.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use switchboard_core::{ConnectionId, Envelope};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::hub::HubHandle;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub send_queue: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue: 256,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_message_size: 81_920,
        }
    }
}

/// Register with the hub and pump frames until either side gives up.
pub async fn handle_ws_connection(
    socket: WebSocket,
    hub: HubHandle,
    config: ConnectionConfig,
    cancel: CancellationToken,
) {
    let (out_tx, out_rx) = mpsc::channel(config.send_queue);
    let (msg_tx, msg_rx) = mpsc::channel(config.send_queue);
    let Some(id) = hub.register(out_tx, msg_tx).await else {
        debug!("hub stopped, refusing connection");
        return;
    };

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_pump(ws_tx, out_rx, msg_rx, id, config.clone()));
    let mut reader = tokio::spawn(read_pump(ws_rx, hub.clone(), id, config));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
        _ = cancel.cancelled() => {
            reader.abort();
            writer.abort();
        }
    }

    hub.unregister(id).await;
}

async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<String>,
    mut messages: mpsc::Receiver<Envelope>,
    id: ConnectionId,
    config: ConnectionConfig,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        let frame = tokio::select! {
            text = outbound.recv() => match text {
                Some(text) => WsMessage::Text(text.into()),
                None => break,
            },
            envelope = messages.recv() => match envelope {
                Some(envelope) => match envelope.to_json() {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(e) => {
                        warn!(connection_id = id.get(), error = %e, "failed to encode message");
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => {
                trace!(connection_id = id.get(), "ping");
                WsMessage::Ping(Default::default())
            }
        };

        match tokio::time::timeout(config.write_wait, ws_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = id.get(), error = %e, "write failed");
                return;
            }
            Err(_) => {
                warn!(connection_id = id.get(), "write timed out");
                return;
            }
        }
    }

    // The hub closed our queues.
    let _ = tokio::time::timeout(config.write_wait, ws_tx.send(WsMessage::Close(None))).await;
}

async fn read_pump(
    mut ws_rx: SplitStream<WebSocket>,
    hub: HubHandle,
    id: ConnectionId,
    config: ConnectionConfig,
) {
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let frame = match tokio::time::timeout_at(deadline, ws_rx.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(connection_id = id.get(), error = %e, "read failed");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(connection_id = id.get(), "no pong within read deadline");
                return;
            }
        };

        match frame {
            WsMessage::Text(text) => {
                let text = text.as_str();
                if text.len() > config.max_message_size {
                    warn!(connection_id = id.get(), size = text.len(), "message too large");
                    return;
                }
                hub.received(id, text.to_string()).await;
            }
            WsMessage::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
            }
            WsMessage::Close(_) => return,
            _ => {}
        }
    }
}
