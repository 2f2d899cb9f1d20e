use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::heartbeat::{BackoffPolicy, HeartbeatConfig};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    base_url = "https://im.example.com"
//
//   env var:         HUAYI_SERVER__BASE_URL=https://im.example.com
//
//   (single underscore stays within field names: HUAYI_HEARTBEAT__PING_INTERVAL_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
}

/// Where the IM server lives (`[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_path: default_ws_path(),
        }
    }
}

/// Heartbeat tunables (`[heartbeat]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Force-close the push connection after this long without an ack.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

/// Reconnect backoff tunables (`[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            step_ms: default_step_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_ws_path() -> String {
    "/api/ws".to_string()
}
fn default_ping_interval_ms() -> u64 {
    5_000
}
fn default_watchdog_interval_ms() -> u64 {
    30_000
}
fn default_stale_after_ms() -> u64 {
    65_000
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_step_ms() -> u64 {
    800
}
fn default_max_delay_ms() -> u64 {
    10_000
}

/// Build a figment that layers: defaults → config.toml → HUAYI_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HUAYI_SERVER__BASE_URL=http://host:8080`  →  `server.base_url`
///   `HUAYI_RECONNECT__MAX_DELAY_MS=5000`  →  `reconnect.max_delay_ms`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("HUAYI_").split("__"))
}

impl HeartbeatConfig {
    pub fn from_file(fc: &HeartbeatFileConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(fc.ping_interval_ms),
            watchdog_interval: Duration::from_millis(fc.watchdog_interval_ms),
            stale_after: Duration::from_millis(fc.stale_after_ms),
        }
    }
}

impl BackoffPolicy {
    pub fn from_file(fc: &ReconnectFileConfig) -> Self {
        Self {
            base: Duration::from_millis(fc.base_delay_ms),
            step: Duration::from_millis(fc.step_ms),
            max: Duration::from_millis(fc.max_delay_ms),
        }
    }
}

impl ConnectionConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        Ok(Self {
            ws_url: ws_url(&fc.server.base_url, &fc.server.ws_path)?,
            heartbeat: HeartbeatConfig::from_file(&fc.heartbeat),
            backoff: BackoffPolicy::from_file(&fc.reconnect),
        })
    }
}

/// Derive the push-channel URL from the HTTP base URL: `http` → `ws`,
/// `https` → `wss`, path replaced by `ws_path`.
pub fn ws_url(base_url: &str, ws_path: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(base_url)
        .with_context(|| format!("invalid server base_url: {base_url}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => anyhow::bail!("unsupported server scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch {base_url} to {scheme}"))?;
    url.set_path(ws_path);
    url.set_query(None);
    Ok(url.to_string())
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HuayiConfig {
    pub data_dir: PathBuf,
    pub file: FileConfig,
}

impl HuayiConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".huayi"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let file: FileConfig = load_config(&data_dir)
            .extract()
            .context("Failed to load configuration")?;

        Ok(Self { data_dir, file })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn connection(&self) -> Result<ConnectionConfig> {
        ConnectionConfig::from_file(&self.file)
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.file).context("Failed to serialize configuration")
    }

    /// Read-modify-write config.toml to persist a new server base URL. Other
    /// keys in the file are left untouched.
    pub fn save_server_url(&self, base_url: &str) -> Result<()> {
        ws_url(base_url, &self.file.server.ws_path)?;

        let path = self.config_toml_path();
        let mut doc = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            contents
                .parse::<toml::Table>()
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            toml::Table::new()
        };

        let server = doc
            .entry("server")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .context("[server] is not a table")?;
        server.insert(
            "base_url".to_string(),
            toml::Value::String(base_url.to_string()),
        );

        let serialized = toml::to_string_pretty(&doc).context("Failed to serialize config.toml")?;
        std::fs::write(&path, serialized)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
