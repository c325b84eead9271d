//! A directory-backed broker usable by several consumer processes at once.
//!
//! ```text
//! <root>/ready/<id>.json      visible messages, claimed in name order
//! <root>/inflight/<id>.json   leased; the file mtime is the lease start
//! <root>/dead/<id>.json       dead-lettered, kept for operators
//! ```
//!
//! Claims are atomic renames, so two consumers never hold the same lease. A
//! lease older than the visibility timeout is returned to `ready/`. A file
//! that does not decode is moved to `dead/` as-is.

use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};
use crate::queue::{Delivery, MessageSink, MessageSource};
use crate::store::fs::write_atomic;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: String,
    body: String,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dead_reason: Option<String>,
}

/// Spool-directory broker.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
    visibility_timeout: Duration,
}

impl SpoolQueue {
    /// Open (creating if needed) the spool at `root`.
    pub fn open(root: impl Into<PathBuf>, visibility_timeout: Duration) -> Result<Self> {
        let queue = Self {
            root: root.into(),
            visibility_timeout,
        };
        for dir in [queue.ready_dir(), queue.inflight_dir(), queue.dead_dir()] {
            fs::create_dir_all(&dir).map_err(|e| queue_io(&dir, e))?;
        }
        Ok(queue)
    }

    fn ready_dir(&self) -> PathBuf {
        self.root.join("ready")
    }

    fn inflight_dir(&self) -> PathBuf {
        self.root.join("inflight")
    }

    fn dead_dir(&self) -> PathBuf {
        self.root.join("dead")
    }

    pub fn ready_len(&self) -> Result<usize> {
        Ok(list_messages(&self.ready_dir())?.len())
    }

    pub fn inflight_len(&self) -> Result<usize> {
        Ok(list_messages(&self.inflight_dir())?.len())
    }

    pub fn dead_len(&self) -> Result<usize> {
        Ok(list_messages(&self.dead_dir())?.len())
    }

    /// Try to lease one ready message. `None` when another consumer won it or
    /// the file was unreadable and got quarantined.
    fn claim(&self, ready: &Path) -> Result<Option<Delivery>> {
        let Some(name) = ready.file_name() else {
            return Ok(None);
        };

        // The lease starts now, not at enqueue time: stamp before the rename
        // so the file never sits in inflight/ looking expired.
        let stamped = fs::File::options()
            .write(true)
            .open(ready)
            .and_then(|file| file.set_modified(SystemTime::now()));
        match stamped {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(queue_io(ready, e)),
        }

        let leased = self.inflight_dir().join(name);
        match fs::rename(ready, &leased) {
            Ok(()) => {}
            // Another consumer won the claim.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(queue_io(ready, e)),
        }

        let data = match fs::read(&leased) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(message = %leased.display(), "Lost claim to another consumer");
                return Ok(None);
            }
            Err(e) => return Err(queue_io(&leased, e)),
        };
        let mut envelope: Envelope = match serde_json::from_slice(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.quarantine(&leased, name, &e.to_string())?;
                return Ok(None);
            }
        };

        envelope.delivery_count += 1;
        write_atomic(&leased, &serde_json::to_vec(&envelope)?)?;

        debug!(id = %envelope.id, delivery_count = envelope.delivery_count, "Claimed message");
        Ok(Some(Delivery {
            id: envelope.id,
            body: envelope.body,
            delivery_count: envelope.delivery_count,
        }))
    }

    /// Move an undecodable message file into `dead/` untouched.
    fn quarantine(&self, leased: &Path, name: &OsStr, reason: &str) -> Result<()> {
        let dead = self.dead_dir().join(name);
        error!(
            message = %leased.display(),
            error = reason,
            "Unreadable message envelope; moved to dead letters"
        );
        match fs::rename(leased, &dead) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(queue_io(leased, e)),
        }
    }

    /// Return expired leases to `ready/`.
    fn reclaim_expired(&self) -> Result<()> {
        let now = SystemTime::now();
        for path in list_messages(&self.inflight_dir())? {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                // Acked or reclaimed by someone else meanwhile.
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.visibility_timeout {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            match fs::rename(&path, self.ready_dir().join(name)) {
                Ok(()) => info!(message = %path.display(), "Lease expired; message visible again"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(queue_io(&path, e)),
            }
        }
        Ok(())
    }
}

impl MessageSource for SpoolQueue {
    fn dequeue(&mut self) -> Result<Option<Delivery>> {
        self.reclaim_expired()?;

        for ready in list_messages(&self.ready_dir())? {
            if let Some(delivery) = self.claim(&ready)? {
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let path = self.inflight_dir().join(message_file(&delivery.id));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(id = %delivery.id, "Acked message after its lease expired; it may be processed again");
                Ok(())
            }
            Err(e) => Err(queue_io(&path, e)),
        }
    }

    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<()> {
        let leased = self.inflight_dir().join(message_file(&delivery.id));
        let data = match fs::read(&leased) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(id = %delivery.id, "Dead-lettered message after its lease expired; it may be delivered again");
                return Ok(());
            }
            Err(e) => return Err(queue_io(&leased, e)),
        };
        let mut envelope: Envelope = serde_json::from_slice(&data)?;
        envelope.dead_reason = Some(reason.to_string());
        write_atomic(
            &self.dead_dir().join(message_file(&delivery.id)),
            &serde_json::to_vec_pretty(&envelope)?,
        )?;
        fs::remove_file(&leased).map_err(|e| queue_io(&leased, e))
    }
}

impl MessageSink for SpoolQueue {
    fn publish(&mut self, body: &str) -> Result<String> {
        let now = Utc::now();
        let id = format!(
            "{}-{:08}-{:06}",
            now.format("%Y%m%d%H%M%S%9f"),
            std::process::id(),
            ID_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let envelope = Envelope {
            id: id.clone(),
            body: body.to_string(),
            delivery_count: 0,
            enqueued_at: now,
            dead_reason: None,
        };
        write_atomic(
            &self.ready_dir().join(message_file(&id)),
            &serde_json::to_vec(&envelope)?,
        )?;
        Ok(id)
    }
}

fn message_file(id: &str) -> String {
    format!("{id}.json")
}

/// Message files in `dir`, sorted by name (enqueue order).
fn list_messages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| queue_io(dir, e))? {
        let entry = entry.map_err(|e| queue_io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with('.') && name.ends_with(".json") {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

fn queue_io(path: &Path, e: std::io::Error) -> RelayError {
    RelayError::Queue(format!("{}: {e}", path.display()))
}
