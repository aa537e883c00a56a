use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_SECS: u64 = 5;
/// Finest supported recurrence interval is one minute; ticking slower would drop fires.
pub const MAX_TICK_SECS: u64 = 60;
pub const DEFAULT_CLAIM_LEASE_SECS: u64 = 300;
pub const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Top-level config (dosewatch.toml + DOSEWATCH_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DosewatchConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for the scheduler loop. None of these affect correctness
/// except `tick_secs`, which is capped at [`MAX_TICK_SECS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// A claim that has not reached `fired` after this long may be taken
    /// over by another instance.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Upper bound on a single notification delivery.
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
    /// Identifies this instance in claim rows. Defaults to a fresh UUIDv7.
    pub worker_id: Option<String>,
}

impl SchedulerConfig {
    /// Tick cadence clamped to `1..=MAX_TICK_SECS`.
    pub fn effective_tick_secs(&self) -> u64 {
        if self.tick_secs > MAX_TICK_SECS {
            tracing::warn!(
                configured = self.tick_secs,
                max = MAX_TICK_SECS,
                "scheduler.tick_secs exceeds the finest recurrence interval; clamping"
            );
        }
        self.tick_secs.clamp(1, MAX_TICK_SECS)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
            notify_timeout_ms: DEFAULT_NOTIFY_TIMEOUT_MS,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// When set, each delivery is POSTed here as `{"owner_id", "message"}`.
    /// When unset, deliveries are only logged.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "max_page_size")]
    pub max_page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_claim_lease_secs() -> u64 {
    DEFAULT_CLAIM_LEASE_SECS
}
fn default_notify_timeout_ms() -> u64 {
    DEFAULT_NOTIFY_TIMEOUT_MS
}
fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
fn max_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dosewatch/dosewatch.db", home)
}

impl DosewatchConfig {
    /// Load config from a TOML file with DOSEWATCH_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `DOSEWATCH_SCHEDULER__TICK_SECS=10`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.dosewatch/dosewatch.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DosewatchConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DOSEWATCH_").split("__"))
            .extract()
            .map_err(|e| crate::error::DosewatchError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dosewatch/dosewatch.toml", home)
}
