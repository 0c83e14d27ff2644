//! Forwards prediction stream entries to the participants they belong to.

use std::sync::Arc;
use std::time::Duration;

use switchboard_bus::{EventStream, StreamEntry};
use switchboard_core::{Envelope, ParticipantId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::participants::ParticipantManager;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    pub block: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stream: "predictions".to_string(),
            group: "cg:PREDICTIONS".to_string(),
            consumer: "svc:sgn:".to_string(),
            count: 1,
            block: Duration::from_secs(2),
        }
    }
}

/// What happened to one stream entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    UnknownParticipant,
    Malformed(&'static str),
    QueueFull,
}

pub struct PredictionBridge {
    stream: Arc<dyn EventStream>,
    participants: Arc<ParticipantManager>,
    config: BridgeConfig,
}

impl PredictionBridge {
    pub fn new(stream: Arc<dyn EventStream>, participants: Arc<ParticipantManager>, config: BridgeConfig) -> Self {
        Self {
            stream,
            participants,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        debug!(stream = %self.config.stream, group = %self.config.group, "prediction bridge started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
        }
        debug!("prediction bridge stopped");
    }

    /// One read cycle; returns how many entries were handled.
    pub async fn poll_once(&self) -> usize {
        let cfg = &self.config;
        if let Err(e) = self.stream.ensure_group(&cfg.stream, &cfg.group).await {
            warn!(error = %e, "failed to ensure consumer group");
        }

        let entries = match self
            .stream
            .read_group(&cfg.stream, &cfg.group, &cfg.consumer, cfg.count, cfg.block)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "stream read failed");
                // Avoid spinning on a broken backend.
                tokio::time::sleep(cfg.block).await;
                return 0;
            }
        };

        for entry in &entries {
            let outcome = self.deliver(entry);
            trace!(entry_id = %entry.id, ?outcome, "prediction handled");
            if let Err(e) = self
                .stream
                .ack(&cfg.stream, &cfg.group, std::slice::from_ref(&entry.id))
                .await
            {
                warn!(entry_id = %entry.id, error = %e, "ack failed");
            }
        }
        entries.len()
    }

    pub fn deliver(&self, entry: &StreamEntry) -> Delivery {
        let Some(participant_id) = entry.field("participantId") else {
            return Delivery::Malformed("participantId");
        };
        let Some(count) = entry.field("pcount").and_then(|v| v.parse::<i64>().ok()) else {
            return Delivery::Malformed("pcount");
        };

        let participant_id = ParticipantId::from_raw(participant_id);
        if !self.participants.contains(&participant_id) {
            return Delivery::UnknownParticipant;
        }

        debug!(
            participant_id = %participant_id,
            timestamp = entry.field("timestamp").unwrap_or_default(),
            prediction_count = count,
            "prediction received"
        );
        if self.participants.enqueue(participant_id, Envelope::prediction(&entry.fields)) {
            Delivery::Queued
        } else {
            Delivery::QueueFull
        }
    }
}
