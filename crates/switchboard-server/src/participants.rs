//! Participant sessions.
//!
//! A participant belongs to one tenant, is reachable through one or more
//! client connections, and is bound to at most one media bridge once an
//! offer has been obtained for it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_core::{ConnectionId, CoordinatorError, Envelope, ParticipantId, TenantId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::BackendWorker;
use crate::hub::{BroadcastMessage, HubHandle};
use crate::orchestrator::Orchestrator;
use crate::tenants::TenantManager;

#[derive(Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub tenant_id: TenantId,
    pub connections: BTreeSet<ConnectionId>,
    pub backend: Option<Arc<BackendWorker>>,
}

/// A notification addressed to every connection of a participant.
#[derive(Clone, Debug)]
pub struct ParticipantMessage {
    pub participant_id: ParticipantId,
    pub message: Envelope,
}

#[derive(Default)]
struct Index {
    by_id: HashMap<ParticipantId, Participant>,
    by_connection: HashMap<ConnectionId, ParticipantId>,
}

impl Index {
    /// Detach a connection; returns the participant if it has none left.
    fn detach(&mut self, connection: ConnectionId) -> Option<Participant> {
        let participant_id = self.by_connection.remove(&connection)?;
        let participant = self.by_id.get_mut(&participant_id)?;
        participant.connections.remove(&connection);
        if participant.connections.is_empty() {
            self.by_id.remove(&participant_id)
        } else {
            None
        }
    }
}

pub struct ParticipantManager {
    tenants: Arc<TenantManager>,
    orchestrator: Arc<Orchestrator>,
    index: Mutex<Index>,
    outbound: mpsc::Sender<ParticipantMessage>,
}

impl ParticipantManager {
    /// Returns the manager and the receiving end of its outbound queue.
    pub fn new(
        tenants: Arc<TenantManager>,
        orchestrator: Arc<Orchestrator>,
        queue: usize,
    ) -> (Self, mpsc::Receiver<ParticipantMessage>) {
        let (tx, rx) = mpsc::channel(queue);
        let manager = Self {
            tenants,
            orchestrator,
            index: Mutex::new(Index::default()),
            outbound: tx,
        };
        (manager, rx)
    }

    /// A connection joining again replaces its previous participant.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, connection_id = connection.get()))]
    pub fn create_participant(
        &self,
        tenant_id: &TenantId,
        connection: ConnectionId,
    ) -> Result<ParticipantId, CoordinatorError> {
        if !self.tenants.contains(tenant_id) {
            return Err(CoordinatorError::TenantNotFound(tenant_id.to_string()));
        }

        let id = ParticipantId::new();
        let replaced = {
            let mut index = self.index.lock();
            let replaced = index.detach(connection);
            index.by_id.insert(
                id.clone(),
                Participant {
                    id: id.clone(),
                    tenant_id: tenant_id.clone(),
                    connections: BTreeSet::from([connection]),
                    backend: None,
                },
            );
            index.by_connection.insert(connection, id.clone());
            replaced
        };
        if let Some(old) = replaced {
            self.tenants.remove_participant(&old.tenant_id, &old.id);
        }
        self.tenants.add_participant(tenant_id, id.clone())?;

        info!(participant_id = %id, "participant created");
        Ok(id)
    }

    /// Pick a media bridge, obtain an offer from it, and bind the
    /// participant to it.
    #[instrument(skip(self), fields(participant_id = %id))]
    pub async fn prepare_participant(&self, id: &ParticipantId) -> Result<String, CoordinatorError> {
        let worker = self
            .orchestrator
            .select_backend()
            .ok_or(CoordinatorError::NoBackendAvailable)?;

        let offer = worker
            .request_offer(id)
            .await
            .map_err(|e| CoordinatorError::RequestFailed {
                worker: worker.descriptor().encode(),
                source: Box::new(e),
            })?;

        let mut index = self.index.lock();
        let participant = index
            .by_id
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::ParticipantNotFound(id.to_string()))?;
        info!(worker = %worker.descriptor(), "media bridge assigned");
        participant.backend = Some(worker);
        Ok(offer)
    }

    /// Forward a client's SDP answer to the participant's media bridge.
    #[instrument(skip(self, sdp), fields(connection_id = connection.get()))]
    pub async fn submit_answer(&self, connection: ConnectionId, sdp: &str) -> Result<String, CoordinatorError> {
        let (participant_id, worker) = {
            let index = self.index.lock();
            let participant = index
                .by_connection
                .get(&connection)
                .and_then(|id| index.by_id.get(id))
                .ok_or(CoordinatorError::AnswerBeforeJoin(connection.get()))?;
            let worker = participant
                .backend
                .clone()
                .ok_or_else(|| CoordinatorError::NoBackendBound(participant.id.to_string()))?;
            (participant.id.clone(), worker)
        };

        self.orchestrator
            .accept_answer(&worker, &participant_id, sdp)
            .await
            .map_err(|e| CoordinatorError::RequestFailed {
                worker: worker.descriptor().encode(),
                source: Box::new(e),
            })
    }

    pub fn get(&self, id: &ParticipantId) -> Option<Participant> {
        self.index.lock().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.index.lock().by_id.contains_key(id)
    }

    pub fn participant_for_connection(&self, connection: ConnectionId) -> Option<ParticipantId> {
        self.index.lock().by_connection.get(&connection).cloned()
    }

    pub fn connections_of(&self, id: &ParticipantId) -> Vec<ConnectionId> {
        self.index
            .lock()
            .by_id
            .get(id)
            .map(|p| p.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.index.lock().by_id.len()
    }

    /// Queue a notification without blocking. A full queue drops it.
    pub fn enqueue(&self, participant_id: ParticipantId, message: Envelope) -> bool {
        match self.outbound.try_send(ParticipantMessage { participant_id, message }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(participant_id = %msg.participant_id, kind = %msg.message.kind, "participant queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Forget the connection; a participant left without connections is
    /// removed from every index and from its tenant.
    pub fn on_connection_closed(&self, connection: ConnectionId) {
        let removed = self.index.lock().detach(connection);
        if let Some(participant) = removed {
            self.tenants.remove_participant(&participant.tenant_id, &participant.id);
            info!(participant_id = %participant.id, connection_id = connection.get(), "participant left");
        }
    }

    /// Deliver queued notifications to each participant's connections, in
    /// queue order.
    pub async fn run_outbound(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ParticipantMessage>,
        hub: HubHandle,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let include = self.connections_of(&msg.participant_id);
            if include.is_empty() {
                debug!(participant_id = %msg.participant_id, "participant has no connections, dropping");
                continue;
            }
            let message = match msg.message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(participant_id = %msg.participant_id, error = %e, "failed to encode notification");
                    continue;
                }
            };
            hub.broadcast(BroadcastMessage {
                message,
                include,
                exclude: Vec::new(),
            })
            .await;
        }
        debug!("participant outbound loop stopped");
    }

    /// Tear down participants as the hub reports closed connections.
    pub async fn run_disconnects(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ConnectionId>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                id = rx.recv() => match id {
                    Some(id) => self.on_connection_closed(id),
                    None => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_bus::{LocalBus, MockBehavior, MockMediaBridge};
    use switchboard_core::{ServiceDescriptor, ServiceType};
    use switchboard_store::{Database, TenantRepo};

    use crate::hub::Hub;

    struct Fixture {
        bus: Arc<LocalBus>,
        tenants: Arc<TenantManager>,
        orchestrator: Arc<Orchestrator>,
        manager: Arc<ParticipantManager>,
        rx: Option<mpsc::Receiver<ParticipantMessage>>,
    }

    fn fixture(queue: usize) -> Fixture {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let orchestrator = Arc::new(Orchestrator::new(bus.clone(), Duration::from_secs(3)));
        bus.set_discovery_listener(orchestrator.clone());
        let tenants = Arc::new(TenantManager::new(Arc::new(TenantRepo::new(
            Database::in_memory().unwrap(),
        ))));
        tenants.ensure_tenant(&TenantId::from_raw("t1"), "Tenant One").unwrap();
        let (manager, rx) = ParticipantManager::new(tenants.clone(), orchestrator.clone(), queue);
        Fixture {
            bus,
            tenants,
            orchestrator,
            manager: Arc::new(manager),
            rx: Some(rx),
        }
    }

    fn add_bridge(bus: &LocalBus, id: &str, behavior: MockBehavior) -> Arc<MockMediaBridge> {
        let d = ServiceDescriptor::media_bridge(id);
        let mock = Arc::new(MockMediaBridge::new(d.clone(), behavior));
        bus.register_service(d, mock.clone()).unwrap();
        mock
    }

    #[test]
    fn create_requires_known_tenant() {
        let f = fixture(8);
        let err = f
            .manager
            .create_participant(&TenantId::from_raw("nope"), ConnectionId(1))
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::TenantNotFound(_)));
        assert_eq!(f.manager.count(), 0);
    }

    #[test]
    fn create_indexes_by_id_connection_and_tenant() {
        let f = fixture(8);
        let tenant = TenantId::from_raw("t1");
        let id = f.manager.create_participant(&tenant, ConnectionId(7)).unwrap();

        assert!(id.as_str().starts_with("part_"));
        assert_eq!(f.manager.participant_for_connection(ConnectionId(7)), Some(id.clone()));
        assert_eq!(f.manager.connections_of(&id), vec![ConnectionId(7)]);
        assert_eq!(f.tenants.participant_count(&tenant), 1);
    }

    #[test]
    fn rejoin_replaces_previous_participant() {
        let f = fixture(8);
        let tenant = TenantId::from_raw("t1");
        let first = f.manager.create_participant(&tenant, ConnectionId(1)).unwrap();
        let second = f.manager.create_participant(&tenant, ConnectionId(1)).unwrap();

        assert!(!f.manager.contains(&first));
        assert!(f.manager.contains(&second));
        assert_eq!(f.tenants.participant_count(&tenant), 1);
    }

    #[tokio::test]
    async fn prepare_without_bridges_is_capacity_error() {
        let f = fixture(8);
        let id = f.manager.create_participant(&TenantId::from_raw("t1"), ConnectionId(1)).unwrap();
        let err = f.manager.prepare_participant(&id).await.unwrap_err();
        assert!(err.is_capacity());
        assert!(f.manager.get(&id).unwrap().backend.is_none());
    }

    #[tokio::test]
    async fn prepare_binds_backend_and_returns_offer() {
        let f = fixture(8);
        let mock = add_bridge(&f.bus, "w1", MockBehavior::default());
        let id = f.manager.create_participant(&TenantId::from_raw("t1"), ConnectionId(1)).unwrap();

        let offer = f.manager.prepare_participant(&id).await.unwrap();
        assert!(offer.contains("offer"));
        assert_eq!(mock.offer_count(), 1);
        let bound = f.manager.get(&id).unwrap().backend.unwrap();
        assert_eq!(bound.service_id(), "w1");
    }

    #[tokio::test]
    async fn prepare_failure_names_worker() {
        let f = fixture(8);
        add_bridge(&f.bus, "w1", MockBehavior::failing_offer("busy"));
        let id = f.manager.create_participant(&TenantId::from_raw("t1"), ConnectionId(1)).unwrap();

        let err = f.manager.prepare_participant(&id).await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("svc:mb:w1"));
        assert!(f.manager.get(&id).unwrap().backend.is_none());
    }

    #[tokio::test]
    async fn answer_before_join_makes_no_backend_call() {
        let f = fixture(8);
        let mock = add_bridge(&f.bus, "w1", MockBehavior::default());
        let err = f.manager.submit_answer(ConnectionId(5), "sdp").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AnswerBeforeJoin(5)));
        assert_eq!(mock.accept_count(), 0);
    }

    #[tokio::test]
    async fn answer_without_backend_is_rejected() {
        let f = fixture(8);
        f.manager.create_participant(&TenantId::from_raw("t1"), ConnectionId(1)).unwrap();
        let err = f.manager.submit_answer(ConnectionId(1), "sdp").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoBackendBound(_)));
    }

    #[tokio::test]
    async fn answer_reaches_bound_backend_and_counts_load() {
        let f = fixture(8);
        add_bridge(&f.bus, "w1", MockBehavior::default());
        let id = f.manager.create_participant(&TenantId::from_raw("t1"), ConnectionId(1)).unwrap();
        f.manager.prepare_participant(&id).await.unwrap();

        assert_eq!(f.manager.submit_answer(ConnectionId(1), "v=0").await.unwrap(), "succeeded");
        assert_eq!(f.orchestrator.worker("w1").unwrap().endpoint_count(), 1);
    }

    #[tokio::test]
    async fn two_workers_share_load() {
        let f = fixture(8);
        add_bridge(&f.bus, "w1", MockBehavior::default());
        add_bridge(&f.bus, "w2", MockBehavior::default());
        let tenant = TenantId::from_raw("t1");

        let a = f.manager.create_participant(&tenant, ConnectionId(1)).unwrap();
        f.manager.prepare_participant(&a).await.unwrap();
        f.manager.submit_answer(ConnectionId(1), "sdp").await.unwrap();

        let b = f.manager.create_participant(&tenant, ConnectionId(2)).unwrap();
        f.manager.prepare_participant(&b).await.unwrap();
        assert_eq!(f.manager.get(&a).unwrap().backend.unwrap().service_id(), "w1");
        assert_eq!(f.manager.get(&b).unwrap().backend.unwrap().service_id(), "w2");
    }

    #[test]
    fn closing_last_connection_tears_down() {
        let f = fixture(8);
        let tenant = TenantId::from_raw("t1");
        let id = f.manager.create_participant(&tenant, ConnectionId(3)).unwrap();
        f.manager.on_connection_closed(ConnectionId(3));
        f.manager.on_connection_closed(ConnectionId(3));

        assert!(!f.manager.contains(&id));
        assert_eq!(f.manager.participant_for_connection(ConnectionId(3)), None);
        assert_eq!(f.tenants.participant_count(&tenant), 0);
    }

    #[test]
    fn enqueue_drops_when_full() {
        let f = fixture(1);
        let pid = ParticipantId::new();
        assert!(f.manager.enqueue(pid.clone(), Envelope::error("one")));
        assert!(!f.manager.enqueue(pid, Envelope::error("two")));
    }

    #[tokio::test]
    async fn outbound_loop_broadcasts_to_participant_connections() {
        let mut f = fixture(8);
        let (hub, handle, _commands) = Hub::new(64, 10);
        let cancel = CancellationToken::new();
        tokio::spawn(hub.run(cancel.clone()));

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (msg_tx, _msg_rx) = mpsc::channel(8);
        let conn = handle.register(out_tx, msg_tx).await.unwrap();
        let (other_tx, mut other_rx) = mpsc::channel(8);
        let (other_msg_tx, _other_msg_rx) = mpsc::channel(8);
        handle.register(other_tx, other_msg_tx).await.unwrap();

        let pid = f.manager.create_participant(&TenantId::from_raw("t1"), conn).unwrap();
        let rx = f.rx.take().unwrap();
        tokio::spawn(f.manager.clone().run_outbound(rx, handle.clone(), cancel.clone()));

        assert!(f.manager.enqueue(pid, Envelope::error("hello")));
        let text = out_rx.recv().await.unwrap();
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope, Envelope::error("hello"));

        handle.connection_count().await;
        assert!(other_rx.try_recv().is_err());
        cancel.cancel();
    }
}
