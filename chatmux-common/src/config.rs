//! Configuration loading and resolution
//!
//! Config file resolution order:
//! 1. Explicit path (command-line argument, must exist)
//! 2. `<user config dir>/chatmux/config.toml`
//! 3. `/etc/chatmux/config.toml` (unix only)
//! 4. Compiled defaults
//!
//! Every field has a default, so a config file only needs the keys it changes.
//! Command-line/env overrides are applied by the binary before [`RelayConfig::normalize`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub tailer: TailerConfig,
    pub ingest: IngestConfig,
    pub websocket: WebsocketConfig,
    pub chat: ChatConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Origins allowed to open the chat WebSocket. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Time allowed for ingest sources and writers to wind down on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
            shutdown_grace_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Where the message store lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Temp-dir database removed when the relay closes it
    #[default]
    Ephemeral,
    /// Database at a configured path that survives restarts
    Persistent,
}

impl std::str::FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" | "" => Ok(StorageMode::Ephemeral),
            "persistent" => Ok(StorageMode::Persistent),
            other => Err(Error::Config(format!("unknown storage mode '{}'", other))),
        }
    }
}

/// SQLite storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    /// Extra `key=value` pragmas applied to every connection (e.g. `cache_size=-20000`)
    pub pragmas: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Ephemeral,
            path: None,
            max_connections: 16,
            busy_timeout_ms: 5000,
            pragmas: Vec::new(),
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Resolve the on-disk database location
    ///
    /// Ephemeral stores default to `$TMPDIR/chatmux-<pid>.db`; persistent stores
    /// must name a path.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.mode {
            StorageMode::Ephemeral => Ok(self.path.clone().unwrap_or_else(|| {
                std::env::temp_dir().join(format!("chatmux-{}.db", std::process::id()))
            })),
            StorageMode::Persistent => self.path.clone().ok_or_else(|| {
                Error::Config("persistent storage requires storage.path".to_string())
            }),
        }
    }

    /// Parse the configured extra pragmas into `(name, value)` pairs
    pub fn extra_pragmas(&self) -> Result<Vec<(String, String)>> {
        self.pragmas
            .iter()
            .map(|entry| {
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    Error::Config(format!("pragma '{}' is not key=value", entry))
                })?;
                let (key, value) = (key.trim(), value.trim());
                if key.is_empty() || value.is_empty() {
                    return Err(Error::Config(format!("pragma '{}' is not key=value", entry)));
                }
                // Pragmas are spliced into SQL, so only plain identifiers and literals pass
                let key_ok = key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                let value_ok = value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
                if !key_ok || !value_ok {
                    return Err(Error::Config(format!("pragma '{}' has unsupported characters", entry)));
                }
                Ok((key.to_string(), value.to_string()))
            })
            .collect()
    }
}

/// Change tailer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub batch: u32,
    /// Warn when the newest delivered row lags wall clock by more than this. 0 disables.
    pub max_lag_ms: u64,
    pub persist_offsets: bool,
    pub offset_path: Option<PathBuf>,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1000,
            batch: 200,
            max_lag_ms: 0,
            persist_offsets: false,
            offset_path: None,
        }
    }
}

impl TailerConfig {
    /// Poll period; never zero, even for a config that skipped [`RelayConfig::normalize`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn max_lag(&self) -> Option<Duration> {
        (self.max_lag_ms > 0).then(|| Duration::from_millis(self.max_lag_ms))
    }
}

/// Harvester subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chat_urls: Vec<String>,
    pub bin: String,
    pub args: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// A child that stays up this long counts as a healthy run and resets the backoff
    pub healthy_after_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chat_urls: Vec::new(),
            bin: "gnasty".to_string(),
            args: Vec::new(),
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            healthy_after_ms: 5000,
        }
    }
}

impl IngestConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn healthy_after(&self) -> Duration {
        Duration::from_millis(self.healthy_after_ms)
    }
}

/// Chat WebSocket transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub ping_interval_ms: u64,
    pub pong_wait_ms: u64,
    pub write_deadline_ms: u64,
    pub max_message_bytes: usize,
    /// Stored messages replayed to a viewer before live delivery starts
    pub history_limit: u32,
    /// Per-subscriber queue depth; a full queue drops new messages for that viewer
    pub queue_capacity: usize,
    /// Wrap payloads as `{"type":"chat","data":"..."}`
    pub envelope: bool,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 25_000,
            pong_wait_ms: 30_000,
            write_deadline_ms: 5000,
            max_message_bytes: 131_072,
            history_limit: 100,
            queue_capacity: 64,
            envelope: true,
        }
    }
}

impl WebsocketConfig {
    // Timer periods are clamped to 1ms: a zero interval panics in tokio

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms.max(1))
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms.max(1))
    }
}

/// Enrichment behaviour toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Strip the leading `@` YouTube puts on display names
    pub strip_youtube_at: bool,
    pub show_badges: bool,
    pub help_cooldown_ms: u64,
    /// JSON array of emotes preloaded into the emote cache at startup
    pub emotes_file: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            strip_youtube_at: true,
            show_badges: true,
            help_cooldown_ms: 10_000,
            emotes_file: None,
        }
    }
}

impl ChatConfig {
    pub fn help_cooldown(&self) -> Duration {
        Duration::from_millis(self.help_cooldown_ms)
    }
}

impl RelayConfig {
    /// Load configuration from the explicit path or the first default location found
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            info!("Loading config from {}", path.display());
            return Self::from_file(path);
        }

        match default_config_path() {
            Some(path) => {
                info!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            None => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate and fill derived values after all overrides are applied
    pub fn normalize(&mut self) -> Result<()> {
        let db_path = self.storage.resolved_path()?;
        self.storage.extra_pragmas()?;

        if self.tailer.interval_ms == 0 {
            self.tailer.interval_ms = 200;
        }
        if self.tailer.batch == 0 {
            self.tailer.batch = 500;
        }
        if self.tailer.persist_offsets && self.tailer.offset_path.is_none() {
            let mut offset = db_path.into_os_string();
            offset.push(".offset.json");
            self.tailer.offset_path = Some(PathBuf::from(offset));
        }

        if self.ingest.backoff_base_ms == 0 {
            return Err(Error::Config("ingest.backoff_base_ms must be positive".to_string()));
        }
        if self.ingest.backoff_max_ms < self.ingest.backoff_base_ms {
            warn!(
                base_ms = self.ingest.backoff_base_ms,
                max_ms = self.ingest.backoff_max_ms,
                "Backoff cap below base, raising cap to base"
            );
            self.ingest.backoff_max_ms = self.ingest.backoff_base_ms;
        }
        self.ingest.chat_urls.retain(|url| !url.trim().is_empty());

        if self.websocket.queue_capacity == 0 {
            return Err(Error::Config("websocket.queue_capacity must be positive".to_string()));
        }
        for (key, value) in [
            ("websocket.ping_interval_ms", self.websocket.ping_interval_ms),
            ("websocket.pong_wait_ms", self.websocket.pong_wait_ms),
            ("websocket.write_deadline_ms", self.websocket.write_deadline_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", key)));
            }
        }
        Ok(())
    }

    /// Copy safe to expose over HTTP (harvester arguments may carry credentials)
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.ingest.args = copy.ingest.args.iter().map(|_| "***".to_string()).collect();
        copy
    }
}

fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("chatmux").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/chatmux/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }
    None
}
