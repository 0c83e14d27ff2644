//! Per-worker proxy for one media bridge.
//!
//! Offer and answer requests become bus calls with a fixed timeout. The
//! worker's endpoint map is the load signal the orchestrator balances on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchboard_bus::rpc::{ACCEPT_ANSWER, OFFER_REQUEST};
use switchboard_bus::ServiceBus;
use switchboard_core::{ConnectionState, CoordinatorError, ParticipantId, ServiceDescriptor};
use tracing::{debug, info, instrument};

/// One participant's media endpoint on a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub participant_id: ParticipantId,
    pub state: ConnectionState,
}

pub struct BackendWorker {
    descriptor: ServiceDescriptor,
    bus: Arc<dyn ServiceBus>,
    rpc_timeout: Duration,
    endpoints: Mutex<HashMap<ParticipantId, Endpoint>>,
}

impl BackendWorker {
    pub fn new(descriptor: ServiceDescriptor, bus: Arc<dyn ServiceBus>, rpc_timeout: Duration) -> Self {
        Self {
            descriptor,
            bus,
            rpc_timeout,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.service_id
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn endpoint_state(&self, participant_id: &ParticipantId) -> Option<ConnectionState> {
        self.endpoints.lock().get(participant_id).map(|e| e.state)
    }

    /// Ask the worker for an SDP offer. Does not create an endpoint.
    #[instrument(skip(self), fields(worker = %self.descriptor, participant_id = %participant_id))]
    pub async fn request_offer(&self, participant_id: &ParticipantId) -> Result<String, CoordinatorError> {
        let response = self
            .bus
            .call(
                &self.descriptor,
                OFFER_REQUEST,
                vec![participant_id.to_string()],
                self.rpc_timeout,
            )
            .await?;
        let offer = first_value(OFFER_REQUEST, response)?;
        debug!("offer received");
        Ok(offer)
    }

    /// Hand the client's answer to the worker. Endpoint tracking is left to
    /// the orchestrator, which does it under the registry lock.
    #[instrument(skip(self, sdp), fields(worker = %self.descriptor, participant_id = %participant_id))]
    pub async fn send_answer(
        &self,
        participant_id: &ParticipantId,
        sdp: &str,
    ) -> Result<String, CoordinatorError> {
        let response = self
            .bus
            .call(
                &self.descriptor,
                ACCEPT_ANSWER,
                vec![participant_id.to_string(), sdp.to_string()],
                self.rpc_timeout,
            )
            .await?;
        let result = first_value(ACCEPT_ANSWER, response)?;
        debug!("answer accepted");
        Ok(result)
    }

    /// Start tracking a participant's endpoint in state `new`.
    pub(crate) fn track_endpoint(&self, participant_id: &ParticipantId) {
        let mut endpoints = self.endpoints.lock();
        endpoints.insert(
            participant_id.clone(),
            Endpoint {
                participant_id: participant_id.clone(),
                state: ConnectionState::New,
            },
        );
        info!(worker = %self.descriptor, participant_id = %participant_id, endpoints = endpoints.len(), "endpoint tracked");
    }

    /// Record a state reported by the worker. `failed` drops the endpoint;
    /// a `failed` report for an unknown endpoint is a no-op.
    pub(crate) fn apply_state_change(
        &self,
        participant_id: &ParticipantId,
        new_state: ConnectionState,
    ) -> Result<(), CoordinatorError> {
        let mut endpoints = self.endpoints.lock();
        if new_state.is_failed() {
            if endpoints.remove(participant_id).is_some() {
                info!(worker = %self.descriptor, participant_id = %participant_id, remaining = endpoints.len(), "endpoint failed, removed");
            }
            return Ok(());
        }
        let endpoint = endpoints
            .get_mut(participant_id)
            .ok_or_else(|| CoordinatorError::ParticipantNotFound(participant_id.to_string()))?;
        endpoint.state = new_state;
        Ok(())
    }
}

fn first_value(command: &str, response: Vec<String>) -> Result<String, CoordinatorError> {
    response
        .into_iter()
        .next()
        .ok_or_else(|| CoordinatorError::Remote(format!("{command}: empty response")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_bus::{LocalBus, MockBehavior, MockMediaBridge};
    use switchboard_core::ServiceType;

    fn setup(behavior: MockBehavior) -> (Arc<MockMediaBridge>, BackendWorker) {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let descriptor = ServiceDescriptor::media_bridge("b1");
        let mock = Arc::new(MockMediaBridge::new(descriptor.clone(), behavior));
        bus.register_service(descriptor.clone(), mock.clone()).unwrap();
        let worker = BackendWorker::new(descriptor, bus, Duration::from_secs(3));
        (mock, worker)
    }

    #[tokio::test]
    async fn request_offer_returns_offer_without_endpoint() {
        let (mock, worker) = setup(MockBehavior::default());
        let pid = ParticipantId::from_raw("part_1");
        let offer = worker.request_offer(&pid).await.unwrap();
        assert!(offer.contains("\"offer\""));
        assert_eq!(worker.endpoint_count(), 0);
        assert_eq!(mock.offer_count(), 1);
    }

    #[tokio::test]
    async fn send_answer_leaves_tracking_to_the_caller() {
        let (mock, worker) = setup(MockBehavior::default());
        let pid = ParticipantId::from_raw("part_1");
        assert_eq!(worker.send_answer(&pid, "v=0").await.unwrap(), "succeeded");
        assert_eq!(mock.accept_count(), 1);
        assert_eq!(worker.endpoint_count(), 0);

        worker.track_endpoint(&pid);
        assert_eq!(worker.endpoint_count(), 1);
        assert_eq!(worker.endpoint_state(&pid), Some(ConnectionState::New));
    }

    #[tokio::test]
    async fn failed_accept_creates_nothing() {
        let (_mock, worker) = setup(MockBehavior {
            accept_error: Some("bad sdp".into()),
            ..MockBehavior::default()
        });
        let err = worker
            .send_answer(&ParticipantId::from_raw("p"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Remote(ref m) if m == "bad sdp"));
        assert_eq!(worker.endpoint_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_worker_times_out() {
        let (_mock, worker) = setup(MockBehavior::delayed(Duration::from_secs(5)));
        let err = worker
            .request_offer(&ParticipantId::from_raw("p"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unregistered_worker_is_transport_error() {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let worker = BackendWorker::new(ServiceDescriptor::media_bridge("gone"), bus, Duration::from_secs(1));
        let err = worker.request_offer(&ParticipantId::from_raw("p")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Transport(_)));
    }

    #[test]
    fn failed_state_removes_once() {
        let (_mock, worker) = setup(MockBehavior::default());
        let pid = ParticipantId::from_raw("part_1");
        worker.track_endpoint(&pid);

        worker.apply_state_change(&pid, ConnectionState::Connected).unwrap();
        assert_eq!(worker.endpoint_state(&pid), Some(ConnectionState::Connected));

        worker.apply_state_change(&pid, ConnectionState::Failed).unwrap();
        assert_eq!(worker.endpoint_count(), 0);
        worker.apply_state_change(&pid, ConnectionState::Failed).unwrap();
        assert_eq!(worker.endpoint_count(), 0);
    }

    #[test]
    fn non_failed_state_for_unknown_endpoint_is_not_found() {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let worker = BackendWorker::new(ServiceDescriptor::media_bridge("b1"), bus, Duration::from_secs(1));
        let err = worker
            .apply_state_change(&ParticipantId::from_raw("nobody"), ConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ParticipantNotFound(_)));
    }
}
