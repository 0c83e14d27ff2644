pub mod backend;
pub mod commands;
pub mod connection;
pub mod hub;
pub mod orchestrator;
pub mod participants;
pub mod prediction_bridge;
pub mod server;
pub mod settings;
pub mod tenants;

pub use orchestrator::Orchestrator;
pub use participants::ParticipantManager;
pub use server::{start, ServerConfig, ServerHandle};
pub use settings::{load_settings, load_settings_from_path, LoggingSettings, Settings, SettingsError};
pub use tenants::TenantManager;
