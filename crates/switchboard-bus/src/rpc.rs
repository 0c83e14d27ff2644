use std::time::Duration;

use async_trait::async_trait;
use switchboard_core::{CoordinatorError, ServiceDescriptor};

use crate::error::BusError;

/// Coordinator -> media bridge: `[participantId]` -> `[offer]`.
pub const OFFER_REQUEST: &str = "sdp-offer-req";
/// Coordinator -> media bridge: `[participantId, sdp]` -> `["succeeded"]`.
pub const ACCEPT_ANSWER: &str = "sdp-accept-offer-answer";
/// Media bridge -> coordinator: `[participantId, newState, oldState]`.
pub const STATE_CHANGE: &str = "mb-ice-conn-state-change";
pub const SUCCEEDED: &str = "succeeded";

/// One call travelling over the bus.
#[derive(Clone, Debug)]
pub struct RpcCallRequest {
    pub from: ServiceDescriptor,
    pub command: String,
    pub args: Vec<String>,
}

impl RpcCallRequest {
    pub fn new(from: ServiceDescriptor, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            from,
            command: command.into(),
            args,
        }
    }

    /// Positional argument, or an error naming the command and index.
    pub fn arg(&self, index: usize) -> Result<&str, String> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("{}: missing argument {index}", self.command))
    }
}

/// Handles calls addressed to a service (a worker's commands, or the
/// coordinator's inbound commands). `Err` carries the remote error text.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, req: RpcCallRequest) -> Result<Vec<String>, String>;
}

/// Receives service registration churn from the bus.
pub trait DiscoveryListener: Send + Sync {
    fn on_registered(&self, descriptor: &ServiceDescriptor) -> Result<(), CoordinatorError>;
    fn on_unregistered(
        &self,
        descriptor: &ServiceDescriptor,
        is_zombie: bool,
    ) -> Result<(), CoordinatorError>;
}

/// Outbound half of the bus: synchronous request/response with a deadline.
#[async_trait]
pub trait ServiceBus: Send + Sync {
    fn self_descriptor(&self) -> &ServiceDescriptor;

    async fn call(
        &self,
        target: &ServiceDescriptor,
        command: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<String>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_reports_missing_index() {
        let req = RpcCallRequest::new(
            ServiceDescriptor::media_bridge("b1"),
            "mb-ice-conn-state-change",
            vec!["part_1".into()],
        );
        assert_eq!(req.arg(0).unwrap(), "part_1");
        let err = req.arg(2).unwrap_err();
        assert!(err.contains("mb-ice-conn-state-change"));
        assert!(err.contains('2'));
    }
}
