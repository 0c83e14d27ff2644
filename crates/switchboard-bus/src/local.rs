//! In-process service bus.
//!
//! Services register a `CommandHandler` under their descriptor; the
//! coordinator registers its own inbound commands and a discovery listener.
//! Calls run the target handler under `tokio::time::timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use switchboard_core::ServiceDescriptor;

use crate::error::BusError;
use crate::rpc::{CommandHandler, DiscoveryListener, RpcCallRequest, ServiceBus};

pub struct LocalBus {
    self_descriptor: ServiceDescriptor,
    services: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    commands: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    listener: RwLock<Option<Arc<dyn DiscoveryListener>>>,
}

impl LocalBus {
    pub fn new(self_descriptor: ServiceDescriptor) -> Self {
        Self {
            self_descriptor,
            services: RwLock::new(HashMap::new()),
            commands: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
        }
    }

    pub fn set_discovery_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Register an inbound command served by this process.
    pub fn register_command(&self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.commands.write().insert(command.into(), handler);
    }

    /// A service joins the bus. The discovery listener may reject it, in
    /// which case it is not reachable.
    pub fn register_service(
        &self,
        descriptor: ServiceDescriptor,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), BusError> {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener
                .on_registered(&descriptor)
                .map_err(|e| BusError::Rejected(e.to_string()))?;
        }
        self.services.write().insert(descriptor.encode(), handler);
        Ok(())
    }

    /// A service leaves the bus, either cleanly or because it stopped
    /// renewing its liveness (`is_zombie`).
    pub fn unregister_service(&self, descriptor: &ServiceDescriptor, is_zombie: bool) {
        let removed = self.services.write().remove(&descriptor.encode()).is_some();
        if !removed {
            return;
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            if let Err(e) = listener.on_unregistered(descriptor, is_zombie) {
                tracing::warn!(service = %descriptor, error = %e, "unregister callback failed");
            }
        }
    }

    /// A service calls one of this process's inbound commands.
    pub async fn call_inbound(
        &self,
        from: &ServiceDescriptor,
        command: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<String>, BusError> {
        let handler = self
            .commands
            .read()
            .get(command)
            .cloned()
            .ok_or_else(|| BusError::Remote(format!("unknown command: {command}")))?;
        let req = RpcCallRequest::new(from.clone(), command, args);
        run_with_timeout(handler, req, timeout).await
    }

    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }
}

#[async_trait]
impl ServiceBus for LocalBus {
    fn self_descriptor(&self) -> &ServiceDescriptor {
        &self.self_descriptor
    }

    async fn call(
        &self,
        target: &ServiceDescriptor,
        command: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<String>, BusError> {
        let handler = self
            .services
            .read()
            .get(&target.encode())
            .cloned()
            .ok_or_else(|| BusError::Unreachable(target.encode()))?;
        let req = RpcCallRequest::new(self.self_descriptor.clone(), command, args);
        run_with_timeout(handler, req, timeout).await
    }
}

async fn run_with_timeout(
    handler: Arc<dyn CommandHandler>,
    req: RpcCallRequest,
    timeout: Duration,
) -> Result<Vec<String>, BusError> {
    let command = req.command.clone();
    match tokio::time::timeout(timeout, handler.handle(req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(message)) => Err(BusError::Remote(message)),
        Err(_) => Err(BusError::Timeout {
            command,
            after: timeout,
        }),
    }
}
