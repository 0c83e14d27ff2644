use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use switchboard_bus::{LocalBus, MemoryStream, MockBehavior, MockMediaBridge};
use switchboard_core::{ServiceDescriptor, TenantId};
use switchboard_server::{LoggingSettings, ServerConfig, Settings, TenantManager};
use switchboard_store::{Database, TenantRepo};
use switchboard_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Routes participants to media bridge workers")]
struct Cli {
    /// Listen port (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default: ~/.switchboard/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Start this many in-process mock media bridges.
    #[arg(long, default_value_t = 0)]
    mock_bridges: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings: Settings = match &cli.settings {
        Some(path) => switchboard_server::load_settings_from_path(path),
        None => switchboard_server::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = init_telemetry(telemetry_config(&settings.logging)?);
    let persisted_warnings = telemetry.logs().and_then(|logs| logs.count().ok());
    tracing::info!(?persisted_warnings, "starting switchboard");

    let db_path = PathBuf::from(&settings.store.database_path);
    let db = Database::open(&db_path).context("failed to open database")?;

    let tenants = Arc::new(TenantManager::new(Arc::new(TenantRepo::new(db))));
    tenants.load_from_store().context("failed to load tenants")?;
    tenants
        .ensure_tenant(
            &TenantId::from_raw(settings.tenants.default_id.clone()),
            &settings.tenants.default_name,
        )
        .context("failed to create default tenant")?;

    let bus = Arc::new(LocalBus::new(settings.self_descriptor()));
    let stream = Arc::new(MemoryStream::new());

    let handle = switchboard_server::start(
        ServerConfig::from_settings(&settings),
        bus.clone(),
        stream,
        tenants,
    )
    .await
    .context("failed to start server")?;

    for i in 1..=cli.mock_bridges {
        let descriptor = ServiceDescriptor::media_bridge(format!("mock-{i}"));
        let mock = Arc::new(MockMediaBridge::new(descriptor.clone(), MockBehavior::connecting()));
        mock.attach(Arc::downgrade(&bus));
        bus.register_service(descriptor, mock)
            .context("failed to register mock media bridge")?;
    }

    tracing::info!(port = handle.port, workers = handle.orchestrator.worker_count(), "switchboard ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn parse_level(value: &str) -> anyhow::Result<tracing::Level> {
    value
        .parse::<tracing::Level>()
        .with_context(|| format!("invalid log level {value:?}"))
}

fn telemetry_config(logging: &LoggingSettings) -> anyhow::Result<TelemetryConfig> {
    let module_levels = logging
        .modules
        .iter()
        .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(TelemetryConfig {
        log_level: parse_level(&logging.level)?,
        module_levels,
        json: logging.json,
        log_to_sqlite: logging.persist,
        log_db_path: PathBuf::from(&logging.database_path),
        retention_days: logging.retention_days,
    })
}
