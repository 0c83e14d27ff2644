use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use switchboard_bus::rpc::STATE_CHANGE;
use switchboard_bus::{EventStream, LocalBus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::commands::{self, CommandRegistry};
use crate::connection::{self, ConnectionConfig};
use crate::hub::{Hub, HubHandle};
use crate::orchestrator::{Orchestrator, StateChangeHandler};
use crate::participants::ParticipantManager;
use crate::prediction_bridge::{BridgeConfig, PredictionBridge};
use crate::settings::Settings;
use crate::tenants::TenantManager;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub event_queue: usize,
    pub command_queue: usize,
    pub participant_queue: usize,
    pub rpc_timeout: Duration,
    pub connection: ConnectionConfig,
    pub bridge: BridgeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            event_queue: 1024,
            command_queue: 10,
            participant_queue: 256,
            rpc_timeout: Duration::from_secs(3),
            connection: ConnectionConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            command_queue: server.command_queue,
            participant_queue: server.participant_queue,
            rpc_timeout: settings.rpc_timeout(),
            connection: ConnectionConfig {
                send_queue: server.send_queue,
                write_wait: Duration::from_millis(server.write_wait_ms),
                pong_wait: Duration::from_millis(server.pong_wait_ms),
                ping_period: Duration::from_millis(server.ping_period_ms),
                max_message_size: server.max_message_size,
            },
            bridge: BridgeConfig {
                stream: settings.stream.name.clone(),
                group: settings.stream.group.clone(),
                consumer: settings.self_descriptor().encode(),
                count: settings.stream.count,
                block: Duration::from_millis(settings.stream.block_ms),
            },
            ..Self::default()
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub connection: ConnectionConfig,
    pub cancel: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Wire every component, spawn the background tasks and start listening.
///
/// The orchestrator becomes the bus's discovery listener, so workers must
/// register on `bus` after this returns.
pub async fn start(
    config: ServerConfig,
    bus: Arc<LocalBus>,
    stream: Arc<dyn EventStream>,
    tenants: Arc<TenantManager>,
) -> Result<ServerHandle, std::io::Error> {
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let orchestrator = Arc::new(Orchestrator::new(bus.clone(), config.rpc_timeout));
    bus.set_discovery_listener(orchestrator.clone());
    bus.register_command(STATE_CHANGE, Arc::new(StateChangeHandler::new(orchestrator.clone())));

    let (participants, outbound_rx) =
        ParticipantManager::new(tenants, orchestrator.clone(), config.participant_queue);
    let participants = Arc::new(participants);

    let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
    let (hub, hub_handle, command_rx) = Hub::new(config.event_queue, config.command_queue);
    let registry = CommandRegistry::standard(participants.clone(), hub_handle.clone());
    let hub = hub
        .with_command_types(registry.kinds())
        .with_disconnect_listener(disconnect_tx);

    tasks.push(tokio::spawn(hub.run(cancel.clone())));
    tasks.push(tokio::spawn(commands::run_commands(command_rx, registry, cancel.clone())));
    tasks.push(tokio::spawn(participants.clone().run_outbound(
        outbound_rx,
        hub_handle.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(
        participants.clone().run_disconnects(disconnect_rx, cancel.clone()),
    ));
    let bridge = PredictionBridge::new(stream, participants.clone(), config.bridge.clone());
    tasks.push(tokio::spawn(bridge.run(cancel.clone())));

    let app_state = AppState {
        hub: hub_handle.clone(),
        orchestrator: orchestrator.clone(),
        connection: config.connection.clone(),
        cancel: cancel.clone(),
    };
    let router = build_router(app_state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "switchboard server started");

    let shutdown = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "http server failed");
        }
    }));

    Ok(ServerHandle {
        port: local_addr.port(),
        hub: hub_handle,
        orchestrator,
        participants,
        cancel,
        tasks,
    })
}

/// Handle returned by `start()`; owns every background task.
pub struct ServerHandle {
    pub port: u16,
    pub hub: HubHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub participants: Arc<ParticipantManager>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("switchboard server stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.connection.max_message_size)
        .on_upgrade(move |socket| {
            connection::handle_ws_connection(
                socket,
                state.hub,
                state.connection,
                state.cancel.child_token(),
            )
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.hub.connection_count().await,
        "workers": state.orchestrator.worker_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_bus::{MemoryStream, MockBehavior, MockMediaBridge};
    use switchboard_core::{ServiceDescriptor, ServiceType, TenantId};
    use switchboard_store::{Database, TenantRepo};

    fn deps() -> (Arc<LocalBus>, Arc<MemoryStream>, Arc<TenantManager>) {
        let bus = Arc::new(LocalBus::new(ServiceDescriptor::new(ServiceType::Signaling, "")));
        let stream = Arc::new(MemoryStream::new());
        let tenants = Arc::new(TenantManager::new(Arc::new(TenantRepo::new(
            Database::in_memory().unwrap(),
        ))));
        tenants.ensure_tenant(&TenantId::from_raw("defaultTenant"), "Default Tenant").unwrap();
        (bus, stream, tenants)
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (bus, stream, tenants) = deps();
        let handle = start(local_config(), bus.clone(), stream, tenants).await.unwrap();
        assert!(handle.port > 0);

        let d = ServiceDescriptor::media_bridge("w1");
        bus.register_service(d.clone(), Arc::new(MockMediaBridge::new(d, MockBehavior::default())))
            .unwrap();

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["workers"], 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bus_rejects_unknown_service_types_after_start() {
        let (bus, stream, tenants) = deps();
        let handle = start(local_config(), bus.clone(), stream, tenants).await.unwrap();
        let d = ServiceDescriptor::parse("svc:xyz:1").unwrap();
        let result = bus.register_service(d.clone(), Arc::new(MockMediaBridge::new(d, MockBehavior::default())));
        assert!(result.is_err());
        assert_eq!(handle.orchestrator.worker_count(), 0);
        handle.shutdown().await;
    }

    #[test]
    fn config_from_settings_carries_wire_constants() {
        let mut settings = Settings::default();
        settings.orchestration.service_id = "east".into();
        let config = ServerConfig::from_settings(&settings);
        assert_eq!(config.connection.max_message_size, 81_920);
        assert_eq!(config.connection.ping_period, Duration::from_secs(54));
        assert_eq!(config.bridge.consumer, "svc:sgn:east");
        assert_eq!(config.bridge.block, Duration::from_secs(2));
        assert_eq!(config.event_queue, 1024);
    }
}
