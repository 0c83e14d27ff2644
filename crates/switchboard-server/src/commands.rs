//! Client commands and their serialized executor.
//!
//! The hub only decodes and queues commands; a single executor task runs
//! them one at a time so that worker RPCs never stall the hub loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::messages::{JoinRequest, SdpAnswer, JOIN, SDP_OFFER_ANSWER};
use switchboard_core::{ConnectionId, CoordinatorError, Envelope, TenantId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{Command, HubHandle};
use crate::participants::ParticipantManager;

#[async_trait]
pub trait ClientCommand: Send + Sync {
    async fn execute(&self, sender: ConnectionId, data: serde_json::Value) -> Result<(), CoordinatorError>;
}

/// Command handlers keyed by message type.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn ClientCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Join` and `SdpOfferAnswer` wired to the session manager.
    pub fn standard(participants: Arc<ParticipantManager>, hub: HubHandle) -> Self {
        let mut registry = Self::new();
        registry.register(
            JOIN,
            Arc::new(JoinCommand {
                participants: Arc::clone(&participants),
                hub: hub.clone(),
            }),
        );
        registry.register(SDP_OFFER_ANSWER, Arc::new(SdpOfferAnswerCommand { participants, hub }));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn ClientCommand>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn kinds(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub async fn dispatch(&self, command: Command) -> Result<(), CoordinatorError> {
        let handler = self
            .handlers
            .get(&command.kind)
            .ok_or_else(|| CoordinatorError::UnknownMessageType(command.kind.clone()))?;
        handler.execute(command.sender, command.data).await
    }
}

/// Execute queued commands one at a time until cancelled.
pub async fn run_commands(
    mut rx: mpsc::Receiver<Command>,
    registry: CommandRegistry,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        let sender = command.sender;
        let kind = command.kind.clone();
        if let Err(e) = registry.dispatch(command).await {
            warn!(connection_id = sender.get(), %kind, error = %e, error_kind = e.error_kind(), "command failed");
        }
    }
    debug!("command executor stopped");
}

pub struct JoinCommand {
    participants: Arc<ParticipantManager>,
    hub: HubHandle,
}

impl JoinCommand {
    async fn join(&self, sender: ConnectionId, data: serde_json::Value) -> Result<String, CoordinatorError> {
        let request: JoinRequest =
            serde_json::from_value(data).map_err(|e| CoordinatorError::InvalidMessage(e.to_string()))?;
        let tenant_id = TenantId::from_raw(request.tenant_id);
        info!(connection_id = sender.get(), tenant_id = %tenant_id, "client joining");

        let participant_id = self.participants.create_participant(&tenant_id, sender)?;
        self.participants.prepare_participant(&participant_id).await
    }
}

#[async_trait]
impl ClientCommand for JoinCommand {
    async fn execute(&self, sender: ConnectionId, data: serde_json::Value) -> Result<(), CoordinatorError> {
        match self.join(sender, data).await {
            Ok(offer) => {
                self.hub.send(sender, Envelope::sdp_offer(offer)).await;
                Ok(())
            }
            Err(e) => {
                self.hub.send(sender, Envelope::join_error(e.to_string())).await;
                Err(e)
            }
        }
    }
}

pub struct SdpOfferAnswerCommand {
    participants: Arc<ParticipantManager>,
    hub: HubHandle,
}

#[async_trait]
impl ClientCommand for SdpOfferAnswerCommand {
    async fn execute(&self, sender: ConnectionId, data: serde_json::Value) -> Result<(), CoordinatorError> {
        let answer: SdpAnswer = match serde_json::from_value(data) {
            Ok(answer) => answer,
            Err(e) => {
                let err = CoordinatorError::InvalidMessage(e.to_string());
                self.hub.send(sender, Envelope::error(err.to_string())).await;
                return Err(err);
            }
        };

        match self.participants.submit_answer(sender, &answer.sdp).await {
            Ok(_) => {
                debug!(connection_id = sender.get(), "answer accepted by media bridge");
                Ok(())
            }
            // Nothing to tell a client that never joined.
            Err(e @ CoordinatorError::AnswerBeforeJoin(_)) => Err(e),
            Err(e) => {
                self.hub.send(sender, Envelope::error(e.to_string())).await;
                Err(e)
            }
        }
    }
}
