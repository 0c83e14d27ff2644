//! Media bridge registry.
//!
//! Tracks live `mb` workers as the discovery layer reports them, picks the
//! least-loaded one for new participants, and serves the state-change
//! command workers call back with.
//!
//! Every change to a worker's endpoint set happens while the registry lock
//! is held, so selection always compares a consistent set of counts. Lock
//! order is registry first, then a worker's endpoint map.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchboard_bus::rpc::{STATE_CHANGE, SUCCEEDED};
use switchboard_bus::{CommandHandler, DiscoveryListener, RpcCallRequest, ServiceBus};
use switchboard_core::{
    ConnectionState, CoordinatorError, ParticipantId, ServiceDescriptor, ServiceType,
};
use tracing::{debug, info, warn};

use crate::backend::BackendWorker;

pub struct Orchestrator {
    bus: Arc<dyn ServiceBus>,
    rpc_timeout: Duration,
    workers: Mutex<BTreeMap<String, Arc<BackendWorker>>>,
}

impl Orchestrator {
    pub fn new(bus: Arc<dyn ServiceBus>, rpc_timeout: Duration) -> Self {
        Self {
            bus,
            rpc_timeout,
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn on_worker_registered(&self, descriptor: &ServiceDescriptor) -> Result<(), CoordinatorError> {
        match &descriptor.service_type {
            ServiceType::MediaBridge => {
                let worker = Arc::new(BackendWorker::new(
                    descriptor.clone(),
                    Arc::clone(&self.bus),
                    self.rpc_timeout,
                ));
                let mut workers = self.workers.lock();
                workers.insert(descriptor.service_id.clone(), worker);
                info!(worker = %descriptor, total = workers.len(), "media bridge registered");
                Ok(())
            }
            ServiceType::Inference => {
                info!(service = %descriptor, "inference service registered");
                Ok(())
            }
            other => Err(CoordinatorError::UnknownServiceType(other.as_str().to_string())),
        }
    }

    pub fn on_worker_unregistered(
        &self,
        descriptor: &ServiceDescriptor,
        is_zombie: bool,
    ) -> Result<(), CoordinatorError> {
        match &descriptor.service_type {
            ServiceType::MediaBridge => {
                let mut workers = self.workers.lock();
                if workers.remove(&descriptor.service_id).is_some() {
                    if is_zombie {
                        warn!(worker = %descriptor, total = workers.len(), "media bridge stopped responding, removed");
                    } else {
                        info!(worker = %descriptor, total = workers.len(), "media bridge unregistered");
                    }
                }
                Ok(())
            }
            ServiceType::Inference => {
                debug!(service = %descriptor, is_zombie, "inference service unregistered");
                Ok(())
            }
            other => Err(CoordinatorError::UnknownServiceType(other.as_str().to_string())),
        }
    }

    /// Least-loaded worker; ties go to the lowest service id.
    pub fn select_backend(&self) -> Option<Arc<BackendWorker>> {
        self.workers
            .lock()
            .values()
            .min_by_key(|w| w.endpoint_count())
            .cloned()
    }

    pub fn worker(&self, service_id: &str) -> Option<Arc<BackendWorker>> {
        self.workers.lock().get(service_id).cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Deliver the client's answer through `worker` and start tracking the
    /// endpoint. A worker unregistered while the call was in flight is not
    /// tracked.
    pub async fn accept_answer(
        &self,
        worker: &Arc<BackendWorker>,
        participant_id: &ParticipantId,
        sdp: &str,
    ) -> Result<String, CoordinatorError> {
        let result = worker.send_answer(participant_id, sdp).await?;

        let workers = self.workers.lock();
        match workers.get(worker.service_id()) {
            Some(current) if Arc::ptr_eq(current, worker) => worker.track_endpoint(participant_id),
            _ => warn!(worker = %worker.descriptor(), participant_id = %participant_id, "answer accepted by a worker that is gone"),
        }
        Ok(result)
    }

    pub fn handle_state_change(&self, req: &RpcCallRequest) -> Result<Vec<String>, CoordinatorError> {
        if req.from.service_type != ServiceType::MediaBridge {
            return Err(CoordinatorError::IncompatibleCaller {
                command: req.command.clone(),
                actual: req.from.service_type.as_str().to_string(),
            });
        }

        let arg = |i| req.arg(i).map_err(CoordinatorError::InvalidMessage);
        let participant_id = ParticipantId::from_raw(arg(0)?);
        let new_state: ConnectionState = arg(1)?.parse()?;
        // Informational only; workers may report states we don't model.
        let old_state = arg(2)?;

        let workers = self.workers.lock();
        let worker = workers
            .get(&req.from.service_id)
            .ok_or_else(|| CoordinatorError::UnknownWorker(req.from.encode()))?;

        debug!(
            worker = %req.from,
            participant_id = %participant_id,
            old_state,
            %new_state,
            "connection state changed"
        );
        worker.apply_state_change(&participant_id, new_state)?;
        Ok(vec![SUCCEEDED.to_string()])
    }
}

impl DiscoveryListener for Orchestrator {
    fn on_registered(&self, descriptor: &ServiceDescriptor) -> Result<(), CoordinatorError> {
        self.on_worker_registered(descriptor)
    }

    fn on_unregistered(&self, descriptor: &ServiceDescriptor, is_zombie: bool) -> Result<(), CoordinatorError> {
        self.on_worker_unregistered(descriptor, is_zombie)
    }
}

/// Bus entry point for `mb-ice-conn-state-change`.
pub struct StateChangeHandler {
    orchestrator: Arc<Orchestrator>,
}

impl StateChangeHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub const COMMAND: &'static str = STATE_CHANGE;
}

#[async_trait]
impl CommandHandler for StateChangeHandler {
    async fn handle(&self, req: RpcCallRequest) -> Result<Vec<String>, String> {
        self.orchestrator.handle_state_change(&req).map_err(|e| {
            warn!(caller = %req.from, error = %e, kind = e.error_kind(), "state change rejected");
            e.to_string()
        })
    }
}
