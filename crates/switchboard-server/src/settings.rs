//! Coordinator settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)
//!
//! Objects merge per key, arrays and primitives are replaced, nulls are skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{ServiceDescriptor, ServiceType};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `~/.switchboard`
pub fn data_dir() -> PathBuf {
    home_dir().join(".switchboard")
}

/// `~/.switchboard/settings.json`
pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub orchestration: OrchestrationSettings,
    pub stream: StreamSettings,
    pub store: StoreSettings,
    pub tenants: TenantSettings,
    pub logging: LoggingSettings,
}

/// Client-facing listener, queues and keepalive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue capacity.
    pub send_queue: usize,
    /// Pending client commands awaiting execution.
    pub command_queue: usize,
    /// Pending participant notifications.
    pub participant_queue: usize,
    pub write_wait_ms: u64,
    pub pong_wait_ms: u64,
    /// Must be shorter than `pong_wait_ms`.
    pub ping_period_ms: u64,
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            send_queue: 256,
            command_queue: 10,
            participant_queue: 256,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            ping_period_ms: 54_000,
            max_message_size: 81_920,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationSettings {
    pub rpc_timeout_ms: u64,
    /// Id under which this coordinator announces itself (`svc:sgn:<id>`).
    pub service_id: String,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 3_000,
            service_id: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub name: String,
    pub group: String,
    pub block_ms: u64,
    pub count: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "predictions".to_string(),
            group: "cg:PREDICTIONS".to_string(),
            block_ms: 2_000,
            count: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub database_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: data_dir()
                .join("database")
                .join("switchboard.db")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// Tenant guaranteed to exist after startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantSettings {
    pub default_id: String,
    pub default_name: String,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            default_id: "defaultTenant".to_string(),
            default_name: "Default Tenant".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `error`, `warn`, `info`, `debug` or `trace`. `RUST_LOG` wins when set.
    pub level: String,
    /// Per-module levels, e.g. `{"switchboard_server::hub": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub json: bool,
    /// Persist warn+ events to `database_path`.
    pub persist: bool,
    pub database_path: String,
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: true,
            persist: true,
            database_path: data_dir()
                .join("database")
                .join("logs.db")
                .to_string_lossy()
                .into_owned(),
            retention_days: 7,
        }
    }
}

impl Settings {
    pub fn self_descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceType::Signaling, self.orchestration.service_id.clone())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.orchestration.rpc_timeout_ms)
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Out-of-range or unparseable values are logged and ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("SWITCHBOARD_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_SEND_QUEUE", 1, 65_536) {
        settings.server.send_queue = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_COMMAND_QUEUE", 1, 65_536) {
        settings.server.command_queue = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_PARTICIPANT_QUEUE", 1, 65_536) {
        settings.server.participant_queue = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_PONG_WAIT_MS", 1_000, 600_000) {
        settings.server.pong_wait_ms = v;
        // Keep pings inside the read deadline.
        settings.server.ping_period_ms = v * 9 / 10;
    }
    if let Some(v) = env.usize("SWITCHBOARD_MAX_MESSAGE_SIZE", 1_024, 16_777_216) {
        settings.server.max_message_size = v;
    }

    if let Some(v) = env.u64("SWITCHBOARD_RPC_TIMEOUT_MS", 100, 60_000) {
        settings.orchestration.rpc_timeout_ms = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_SERVICE_ID") {
        settings.orchestration.service_id = v;
    }

    if let Some(v) = env.string("SWITCHBOARD_STREAM") {
        settings.stream.name = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_STREAM_GROUP") {
        settings.stream.group = v;
    }

    if let Some(v) = env.string("SWITCHBOARD_DB") {
        settings.store.database_path = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_DEFAULT_TENANT") {
        settings.tenants.default_id = v;
    }

    if let Some(v) = env.string("SWITCHBOARD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("SWITCHBOARD_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.bool("SWITCHBOARD_LOG_PERSIST") {
        settings.logging.persist = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// `true`/`false`, `1`/`0`, `yes`/`no`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, |v| parse_usize_range(v, min, max))
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, parse_bool)
    }
}
