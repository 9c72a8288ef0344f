use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::StoreError;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [connection]
//                    request_timeout_ms = 20000
//
//   env var:         COMPANION_CONNECTION__REQUEST_TIMEOUT_MS=20000
//
//   (double underscore = nesting, single underscore stays within field names)

/// Deployment presets. They differ only in how persistent reconnection is.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Give up after 3 reconnect attempts; the user retries explicitly.
    Mobile,
    /// Keep reconnecting forever on the same capped backoff curve.
    Desktop,
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(Self::Mobile),
            "desktop" => Ok(Self::Desktop),
            _ => Err(format!("unknown profile: {s} (expected mobile or desktop)")),
        }
    }
}

/// One daemon the user has configured. Owned by the user's settings; the
/// core only reads it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default, alias = "useTls")]
    pub use_tls: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServerConfig {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            host: host.into(),
            port,
            use_tls: false,
            token: token.into(),
            enabled: true,
        }
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Whether switching from `self` to `other` needs a fresh socket.
    pub fn same_endpoint(&self, other: &ServerConfig) -> bool {
        self.id == other.id
            && self.host == other.host
            && self.port == other.port
            && self.use_tls == other.use_tls
            && self.token == other.token
    }
}

fn default_enabled() -> bool {
    true
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Connection tunables (lives under `[connection]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Unset means reconnect forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default)]
    pub probe_on_health_check: bool,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_reconnect_attempts: None,
            probe_on_health_check: false,
        }
    }
}

/// Conversation synchronizer tunables (lives under `[sync]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            page_size: default_page_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_settle_delay_ms() -> u64 {
    50
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}
fn default_keepalive_interval_secs() -> u64 {
    30
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    3_000
}
fn default_page_size() -> usize {
    50
}
fn default_cache_ttl_secs() -> u64 {
    300
}

/// Build a figment that layers: defaults → profile defaults → config.toml → COMPANION_* env vars.
///
/// The CLI profile takes priority over the config file profile.
pub fn load_config(data_dir: &Path, cli_profile: Option<&Profile>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    // Pass 1: peek at profile from config.toml/env (CLI overrides file)
    let base = Figment::from(Serialized::defaults(ClientFileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("COMPANION_").split("__"));

    let profile: Option<Profile> = cli_profile
        .cloned()
        .or_else(|| base.extract_inner("profile").ok());

    // Pass 2: rebuild with profile defaults between struct defaults and config.toml
    let profile_layer = profile_to_file_config(profile.as_ref());

    Figment::from(Serialized::defaults(ClientFileConfig::default()))
        .merge(Serialized::defaults(profile_layer))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("COMPANION_").split("__"))
}

fn profile_to_file_config(profile: Option<&Profile>) -> ClientFileConfig {
    match profile {
        Some(Profile::Mobile) => ClientFileConfig {
            profile: Some(Profile::Mobile),
            connection: ConnectionFileConfig {
                max_reconnect_attempts: Some(3),
                ..Default::default()
            },
            ..Default::default()
        },
        Some(Profile::Desktop) => ClientFileConfig {
            profile: Some(Profile::Desktop),
            connection: ConnectionFileConfig {
                max_reconnect_attempts: None,
                ..Default::default()
            },
            ..Default::default()
        },
        None => ClientFileConfig::default(),
    }
}

// =============================================================================
// Runtime config structs (derived from the file config)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Pause between socket open and the `authenticate` request
    pub settle_delay: Duration,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    /// Default deadline for `send_request`
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    pub keepalive_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` = unbounded
    pub max_reconnect_attempts: Option<u32>,
    /// Send a `ping` request during health checks of an open socket
    pub probe_on_health_check: bool,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            settle_delay: Duration::from_millis(fc.settle_delay_ms),
            connect_timeout: Duration::from_millis(fc.connect_timeout_ms),
            auth_timeout: Duration::from_millis(fc.auth_timeout_ms),
            request_timeout: Duration::from_millis(fc.request_timeout_ms),
            health_timeout: Duration::from_millis(fc.health_timeout_ms),
            keepalive_interval: Duration::from_secs(fc.keepalive_interval_secs.max(1)),
            initial_backoff: Duration::from_millis(fc.initial_backoff_ms),
            max_backoff: Duration::from_millis(fc.max_backoff_ms.max(fc.initial_backoff_ms)),
            max_reconnect_attempts: fc.max_reconnect_attempts,
            probe_on_health_check: fc.probe_on_health_check,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub page_size: usize,
    pub cache_ttl: Duration,
}

impl SyncConfig {
    pub fn from_file(fc: &SyncFileConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(fc.poll_interval_ms.max(1)),
            page_size: fc.page_size.max(1),
            cache_ttl: Duration::from_secs(fc.cache_ttl_secs),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&SyncFileConfig::default())
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct CompanionDirs {
    pub data_dir: PathBuf,
    pub store_dir: PathBuf,
}

impl CompanionDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "could not find home directory",
                    )
                })?
                .join(".companion"),
        };

        let store_dir = data_dir.join("store");
        std::fs::create_dir_all(&store_dir)?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            store_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
