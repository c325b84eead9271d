//! Bringing up an intermittent cellular link.
//!
//! [`ConnectionManager`] walks a USB modem through detection, mode switch and
//! dialing, and hands the caller a [`Connection`] for the duration of a scope.
//! With the `Ethernet` provider every modem step is skipped.
//!
//! ```text
//! NoModem <- Unconfigured -> Configuring -> ModeSwitched -> Dialing -> Connected -> Terminated
//!                  \__________________ Ethernet ____________________/
//! ```

pub mod dialup;
pub mod modem;
pub mod profile;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, info_span, warn, Span};

use crate::config::{self, Config};
use crate::error::{RelayError, Result};

pub use dialup::{
    Connection, Dialer, Link, LinkState, Sleeper, ThreadSleeper, WvdialDialer,
};
pub use modem::{ModemProbe, ModemVariant, UsbModemProbe, SUPPORTED_MODEMS};

/// Where the connection state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NoModem,
    Unconfigured,
    Configuring,
    ModeSwitched,
    Dialing,
    Connected,
    Terminated,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoModem => "no-modem",
            Self::Unconfigured => "unconfigured",
            Self::Configuring => "configuring",
            Self::ModeSwitched => "mode-switched",
            Self::Dialing => "dialing",
            Self::Connected => "connected",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Everything the manager needs besides the hardware seams.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// `Ethernet` or a dialup profile name.
    pub sim_type: String,
    pub modem_config_dir: PathBuf,
    pub sim_config_dir: PathBuf,
    pub dialup_log: PathBuf,
    pub mode_switch_poll: Duration,
    pub max_mode_switch_polls: u32,
    pub dial_poll: Duration,
    pub dial_max_retries: u32,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        let conn = &config.connection;
        Self {
            sim_type: conn.sim_type.clone(),
            modem_config_dir: conn.modem_config_dir.clone(),
            sim_config_dir: conn.sim_config_dir.clone(),
            dialup_log: config::dialup_log_path(config),
            mode_switch_poll: conn.mode_switch_poll(),
            max_mode_switch_polls: conn.max_mode_switch_polls,
            dial_poll: conn.dial_poll(),
            dial_max_retries: conn.dial_max_retries,
        }
    }

    pub fn is_ethernet(&self) -> bool {
        self.sim_type == profile::ETHERNET
    }
}

/// Detects, configures and dials a USB modem.
pub struct ConnectionManager<P, D> {
    probe: P,
    dialer: D,
    sleeper: Box<dyn Sleeper>,
    settings: ConnectionSettings,
    variants: Vec<ModemVariant>,
    state: ConnectionState,
    span: Span,
}

impl<P: ModemProbe, D: Dialer> ConnectionManager<P, D> {
    pub fn new(settings: ConnectionSettings, probe: P, dialer: D) -> Self {
        let span = info_span!("connection", sim_type = %settings.sim_type);
        Self {
            probe,
            dialer,
            sleeper: Box::new(ThreadSleeper),
            settings,
            variants: SUPPORTED_MODEMS.to_vec(),
            state: ConnectionState::Unconfigured,
            span,
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Replace the priority-ordered list of supported variants.
    pub fn with_variants(mut self, variants: Vec<ModemVariant>) -> Self {
        self.variants = variants;
        self
    }

    /// Log inside `span` instead of the default `connection` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Connection state changed");
            self.state = next;
        }
    }

    /// Probe for one variant, or for any supported variant when `None`.
    pub fn is_modem_plugged(&self, variant: Option<&ModemVariant>) -> Result<bool> {
        self.probe.is_plugged(variant)
    }

    /// Return the first plugged variant in priority order.
    pub fn detect_variant<'a>(&self, candidates: &'a [ModemVariant]) -> Result<&'a ModemVariant> {
        for variant in candidates {
            if self.probe.is_plugged(Some(variant))? {
                info!(modem = variant.uid, "Detected modem");
                return Ok(variant);
            }
        }
        Err(RelayError::UnknownModem {
            tried: candidates
                .iter()
                .map(|v| v.uid)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Write the variant's mode-switch file if missing, then switch modes.
    ///
    /// Returns the path of the configuration file used.
    pub fn configure(&mut self, variant: &ModemVariant) -> Result<PathBuf> {
        let _span = self.span.clone().entered();
        self.transition(ConnectionState::Configuring);

        let path = self.settings.modem_config_dir.join(variant.uid);
        write_if_missing(&path, variant.modeswitch)?;
        self.probe.mode_switch(&path)?;
        Ok(path)
    }

    /// Poll every `poll_interval` until the device reports `target_mode`,
    /// giving up after `max_mode_switch_polls` checks.
    pub fn wait_until_mode_switched(
        &mut self,
        target_mode: &str,
        poll_interval: Duration,
    ) -> Result<()> {
        let attempts = self.settings.max_mode_switch_polls.max(1);
        for attempt in 1..=attempts {
            if self.probe.is_in_mode(target_mode)? {
                self.transition(ConnectionState::ModeSwitched);
                return Ok(());
            }
            if attempt < attempts {
                self.sleeper.sleep(poll_interval);
            }
        }
        Err(RelayError::ConnectivityTimeout {
            what: format!("modem mode {target_mode}"),
            attempts,
        })
    }

    /// Make sure a supported modem is attached and in modem mode.
    pub fn setup_modem(&mut self) -> Result<()> {
        let _span = self.span.clone().entered();

        if !self.is_modem_plugged(None)? {
            self.transition(ConnectionState::NoModem);
            return Err(RelayError::NoModem);
        }

        let mut switched = None;
        for variant in &self.variants {
            if self.probe.is_in_mode(variant.target_mode)? {
                switched = Some(variant.target_mode);
                break;
            }
        }
        if let Some(mode) = switched {
            info!(mode, "Modem already switched");
            self.transition(ConnectionState::ModeSwitched);
            return Ok(());
        }

        let variants = self.variants.clone();
        let variant = *self.detect_variant(&variants)?;
        self.configure(&variant)?;
        let poll = self.settings.mode_switch_poll;
        self.wait_until_mode_switched(variant.target_mode, poll)
    }

    /// Path of the dialup profile for the configured provider, written on first use.
    pub fn dialup_profile_path(&self) -> Result<PathBuf> {
        let path = self.settings.sim_config_dir.join(&self.settings.sim_type);
        if path.is_file() {
            return Ok(path);
        }
        let contents = profile::dialup_profile(&self.settings.sim_type).ok_or_else(|| {
            RelayError::Config(format!(
                "no dialup profile for '{}' at {}",
                self.settings.sim_type,
                path.display()
            ))
        })?;
        write_if_missing(&path, contents)?;
        Ok(path)
    }

    /// Start the dialer and poll up to `max_retries` times for the link.
    pub fn dial(
        &mut self,
        profile: &Path,
        log: &Path,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Result<Connection> {
        let _span = self.span.clone().entered();
        dialup::rotate_log(log)?;
        self.transition(ConnectionState::Dialing);

        let mut connection = Connection::new(self.dialer.start(profile, log)?);
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            match connection.state()? {
                LinkState::Up => {
                    self.transition(ConnectionState::Connected);
                    return Ok(connection);
                }
                LinkState::Exited => {
                    self.transition(ConnectionState::Terminated);
                    connection.terminate()?;
                    return Err(RelayError::Command {
                        program: "dialer".to_string(),
                        reason: format!("exited before the link came up (see {})", log.display()),
                    });
                }
                LinkState::Pending if attempt < attempts => self.sleeper.sleep(poll_interval),
                LinkState::Pending => {}
            }
        }

        self.transition(ConnectionState::Terminated);
        connection.terminate()?;
        Err(RelayError::ConnectivityTimeout {
            what: "dialup link".to_string(),
            attempts,
        })
    }

    /// Bring the link up. `None` means no modem is involved (Ethernet).
    pub fn connect(&mut self) -> Result<Option<Connection>> {
        if self.settings.is_ethernet() {
            let _span = self.span.clone().entered();
            self.transition(ConnectionState::Connected);
            return Ok(None);
        }

        self.setup_modem()?;
        let profile = self.dialup_profile_path()?;
        let log = self.settings.dialup_log.clone();
        let retries = self.settings.dial_max_retries;
        let poll = self.settings.dial_poll;
        self.dial(&profile, &log, retries, poll).map(Some)
    }

    /// Run `f` with a live link and terminate it on every exit path.
    ///
    /// The connection is terminated exactly once whether `f` returns `Ok`,
    /// returns `Err`, or panics (through [`Connection`]'s `Drop`).
    pub fn with_connection<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Option<&mut Connection>) -> std::result::Result<T, E>,
        E: From<RelayError>,
    {
        let mut connection = self.connect()?;
        let result = f(connection.as_mut());

        if let Some(mut connection) = connection.take() {
            let _span = self.span.clone().entered();
            if let Err(e) = connection.terminate() {
                warn!(error = %e, "Failed to terminate dialup connection");
            }
        }
        self.transition(ConnectionState::Terminated);
        result
    }
}

fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RelayError::io(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| RelayError::io(path, e))
}
