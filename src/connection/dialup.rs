//! Dialup sessions: the dialer seam, the `wvdial` implementation, and the
//! [`Connection`] handle that guarantees termination.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// What a dialer reports while a link is coming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Still negotiating.
    Pending,
    /// The point-to-point link is up.
    Up,
    /// The dialer process is gone.
    Exited,
}

/// A running dialer session.
pub trait Link {
    fn state(&mut self) -> Result<LinkState>;

    /// Hang up and release the device.
    fn terminate(&mut self) -> Result<()>;
}

/// Starts dialer sessions.
pub trait Dialer {
    /// Launch the dialer with `profile`, writing its output to `log`.
    fn start(&self, profile: &Path, log: &Path) -> Result<Box<dyn Link>>;
}

/// Blocking waits between polls. Swapped out in tests.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A live dialup session.
///
/// Owned by exactly one scope. The link is terminated at most once: either by
/// an explicit [`Connection::terminate`] or when the handle is dropped.
pub struct Connection {
    link: Box<dyn Link>,
    terminated: bool,
}

impl Connection {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            terminated: false,
        }
    }

    pub fn state(&mut self) -> Result<LinkState> {
        if self.terminated {
            return Ok(LinkState::Exited);
        }
        self.link.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Hang up. Calling it again is a no-op.
    pub fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        self.link.terminate()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(error = %e, "Failed to terminate dialup connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Copy the previous dialup log to `<log>.old`, then truncate it.
pub fn rotate_log(log: &Path) -> Result<()> {
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent).map_err(|e| RelayError::io(parent, e))?;
    }
    if log.is_file() {
        let backup = backup_path(log);
        fs::copy(log, &backup).map_err(|e| RelayError::io(&backup, e))?;
    }
    fs::write(log, b"").map_err(|e| RelayError::io(log, e))
}

fn backup_path(log: &Path) -> PathBuf {
    let mut name = log.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

// ── wvdial ──────────────────────────────────────────────────────

/// Marker pppd prints (through wvdial) once an address was negotiated.
const LINK_UP_MARKER: &str = "local  IP address";

/// Dialer backed by the `wvdial` binary.
#[derive(Debug, Clone)]
pub struct WvdialDialer {
    bin: PathBuf,
}

impl WvdialDialer {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Dialer for WvdialDialer {
    fn start(&self, profile: &Path, log: &Path) -> Result<Box<dyn Link>> {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(|e| RelayError::io(log, e))?;

        debug!(profile = %profile.display(), log = %log.display(), "Starting wvdial");
        let child = Command::new(&self.bin)
            .arg("--config")
            .arg(profile)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log_file)
            .spawn()
            .map_err(|e| RelayError::io(&self.bin, e))?;

        Ok(Box::new(WvdialLink {
            child,
            log: log.to_path_buf(),
        }))
    }
}

struct WvdialLink {
    child: Child,
    log: PathBuf,
}

impl Link for WvdialLink {
    fn state(&mut self) -> Result<LinkState> {
        if self
            .child
            .try_wait()
            .map_err(|e| RelayError::io(&self.log, e))?
            .is_some()
        {
            return Ok(LinkState::Exited);
        }
        let log = fs::read_to_string(&self.log).map_err(|e| RelayError::io(&self.log, e))?;
        if log.contains(LINK_UP_MARKER) {
            Ok(LinkState::Up)
        } else {
            Ok(LinkState::Pending)
        }
    }

    fn terminate(&mut self) -> Result<()> {
        match self.child.kill() {
            Ok(()) => {}
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(RelayError::io(&self.log, e)),
        }
        self.child
            .wait()
            .map_err(|e| RelayError::io(&self.log, e))?;
        debug!("wvdial terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingLink(Rc<Cell<u32>>);

    impl Link for CountingLink {
        fn state(&mut self) -> Result<LinkState> {
            Ok(LinkState::Up)
        }

        fn terminate(&mut self) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let count = Rc::new(Cell::new(0));
        let mut conn = Connection::new(Box::new(CountingLink(count.clone())));
        conn.terminate().unwrap();
        conn.terminate().unwrap();
        assert!(conn.is_terminated());
        assert_eq!(conn.state().unwrap(), LinkState::Exited);
        drop(conn);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_drop_terminates() {
        let count = Rc::new(Cell::new(0));
        {
            let _conn = Connection::new(Box::new(CountingLink(count.clone())));
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_rotate_log_backs_up_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("state").join("wvdial.log");

        rotate_log(&log).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "");

        fs::write(&log, "previous session").unwrap();
        rotate_log(&log).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "");
        assert_eq!(
            fs::read_to_string(dir.path().join("state").join("wvdial.log.old")).unwrap(),
            "previous session"
        );
    }
}
