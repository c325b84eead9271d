//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$RELAYMAIL_CONFIG` (environment variable)
//! 2. `~/.config/relaymail/config.toml` (Linux/macOS)
//!    `%APPDATA%\relaymail\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Modem and dialup settings for the client.
    pub connection: ConnectionConfig,
    /// Client sync settings.
    pub sync: SyncConfig,
    /// Server-side ingestion settings.
    pub server: ServerConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override state directory for logs, dialup log and local data.
    pub state_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Modem and dialup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connectivity provider: "Ethernet" or a dialup profile name
    /// ("Vodacom", "Orange", "Airtel", "Hologram").
    pub sim_type: String,
    /// Where per-variant mode-switch files are written.
    pub modem_config_dir: PathBuf,
    /// Where per-provider dialup profiles are written.
    pub sim_config_dir: PathBuf,
    /// Seconds between mode-switch polls.
    pub mode_switch_poll_secs: u64,
    /// Maximum number of mode-switch polls before giving up.
    pub max_mode_switch_polls: u32,
    /// Seconds between dial polls.
    pub dial_poll_secs: u64,
    /// Maximum number of dial polls before giving up.
    pub dial_max_retries: u32,
    /// Binary used to list USB devices.
    pub lsusb_bin: PathBuf,
    /// Binary used to switch modem modes.
    pub modeswitch_bin: PathBuf,
    /// Dialer binary.
    pub wvdial_bin: PathBuf,
}

/// Client sync settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identifier of this client on the shared exchange.
    pub client_id: String,
    /// Directory batches are uploaded into (`<outbox>/<client_id>/`).
    pub outbox_dir: PathBuf,
    /// Directory batches are downloaded from (`<inbox>/<client_id>/`).
    pub inbox_dir: PathBuf,
    /// Local mailbox document. Defaults to `<state_dir>/mailbox.json`.
    pub mailbox_path: Option<PathBuf>,
}

/// Server-side ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Raw inbound MIME blobs.
    pub blob_dir: PathBuf,
    /// Structured email archive.
    pub archive_dir: PathBuf,
    /// Spool queue directory.
    pub queue_dir: PathBuf,
    /// Seconds a claimed message stays invisible before redelivery.
    pub visibility_timeout_secs: u64,
    /// Deliveries after which a failing message is dead-lettered.
    pub max_deliveries: u32,
    /// Milliseconds between polls of an empty queue.
    pub poll_interval_ms: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            sim_type: "Ethernet".to_string(),
            modem_config_dir: PathBuf::from("/etc/usb_modeswitch.d"),
            sim_config_dir: PathBuf::from("/etc/wvdial.d"),
            mode_switch_poll_secs: 2,
            max_mode_switch_polls: 60,
            dial_poll_secs: 1,
            dial_max_retries: 90,
            lsusb_bin: PathBuf::from("lsusb"),
            modeswitch_bin: PathBuf::from("usb_modeswitch"),
            wvdial_bin: PathBuf::from("wvdial"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: "default".to_string(),
            outbox_dir: PathBuf::from("exchange/outbox"),
            inbox_dir: PathBuf::from("exchange/inbox"),
            mailbox_path: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("server/blobs"),
            archive_dir: PathBuf::from("server/emails"),
            queue_dir: PathBuf::from("server/queue"),
            visibility_timeout_secs: 300,
            max_deliveries: 5,
            poll_interval_ms: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn mode_switch_poll(&self) -> Duration {
        Duration::from_secs(self.mode_switch_poll_secs)
    }

    pub fn dial_poll(&self) -> Duration {
        Duration::from_secs(self.dial_poll_secs)
    }
}

impl ServerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("RELAYMAIL_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("relaymail").join("config.toml"))
}

/// Return the state directory for logs, the dialup log and the local mailbox.
pub fn state_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.state_dir {
        return dir.clone();
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relaymail")
}

/// Return the local mailbox path.
pub fn mailbox_path(config: &Config) -> PathBuf {
    config
        .sync
        .mailbox_path
        .clone()
        .unwrap_or_else(|| state_dir(config).join("mailbox.json"))
}

/// Return the dialup log path.
pub fn dialup_log_path(config: &Config) -> PathBuf {
    state_dir(config).join("wvdial.log")
}
