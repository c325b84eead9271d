//! Directory-based sync transport.
//!
//! The client and the server share two directories (a mounted share, a synced
//! folder, removable media). Batches are gzip-compressed JSON lines, one
//! record per email or user:
//!
//! ```text
//! <outbox>/<client_id>/<batch>.jsonl.gz   client -> server
//! <inbox>/<client_id>/<batch>.jsonl.gz    server -> client
//! ```

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::model::{Email, User};
use crate::store::fs::write_atomic;
use crate::sync::Transport;

const BATCH_SUFFIX: &str = ".jsonl.gz";

/// One line of a batch file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record {
    Email(Email),
    User(User),
}

/// Encode emails and users as a gzip-compressed JSON-lines batch.
pub fn encode_batch(emails: &[Email], users: &[User]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let records = emails
        .iter()
        .cloned()
        .map(Record::Email)
        .chain(users.iter().cloned().map(Record::User));
    for record in records {
        serde_json::to_writer(&mut encoder, &record)?;
        encoder.write_all(b"\n")?;
    }
    Ok(encoder.finish()?)
}

/// Decode a batch produced by [`encode_batch`].
pub fn decode_batch(data: impl Read) -> Result<(Vec<Email>, Vec<User>)> {
    let mut emails = Vec::new();
    let mut users = Vec::new();
    for line in BufReader::new(GzDecoder::new(data)).lines() {
        let line = line.map_err(|e| RelayError::Transport(format!("corrupt batch: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line)? {
            Record::Email(email) => emails.push(email),
            Record::User(user) => users.push(user),
        }
    }
    Ok((emails, users))
}

/// Transport over a pair of shared directories.
#[derive(Debug)]
pub struct FsTransport {
    outbox: PathBuf,
    inbox: PathBuf,
    served: Vec<PathBuf>,
}

impl FsTransport {
    pub fn new(outbox_root: impl AsRef<Path>, inbox_root: impl AsRef<Path>, client_id: &str) -> Self {
        Self {
            outbox: outbox_root.as_ref().join(client_id),
            inbox: inbox_root.as_ref().join(client_id),
            served: Vec::new(),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    /// Batch files currently waiting in the inbox, oldest name first.
    fn inbound_batches(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.inbox) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(transport_io(&self.inbox, e)),
        };

        let mut batches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| transport_io(&self.inbox, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') && name.ends_with(BATCH_SUFFIX) {
                batches.push(entry.path());
            }
        }
        batches.sort();
        Ok(batches)
    }
}

impl Transport for FsTransport {
    fn upload(&mut self, emails: &[Email], users: &[User]) -> Result<Vec<Email>> {
        let data = encode_batch(emails, users)?;
        let name = format!(
            "{}-{}{BATCH_SUFFIX}",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            std::process::id()
        );
        let path = self.outbox.join(name);
        write_atomic(&path, &data).map_err(|e| RelayError::Transport(e.to_string()))?;
        debug!(path = %path.display(), emails = emails.len(), users = users.len(), "Uploaded batch");
        Ok(emails.to_vec())
    }

    fn download(&mut self) -> Result<Vec<Email>> {
        let batches = self.inbound_batches()?;
        let mut served = Vec::with_capacity(batches.len());
        let mut emails = Vec::new();
        for path in batches {
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(transport_io(&path, e)),
            };
            // An unreadable batch stays in the inbox and never blocks the others.
            let batch_emails = match decode_batch(file) {
                Ok((batch_emails, _)) => batch_emails,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable inbound batch");
                    continue;
                }
            };
            debug!(path = %path.display(), emails = batch_emails.len(), "Read inbound batch");
            emails.extend(batch_emails.into_iter().map(|mut email| {
                // Inbound mail is delivered mail; it must never look pending.
                email.sent = true;
                email.ensure_uid();
                email
            }));
            served.push(path);
        }
        self.served = served;
        Ok(emails)
    }

    fn confirm_download(&mut self, _emails: &[Email]) -> Result<()> {
        for path in self.served.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(transport_io(&path, e)),
            }
        }
        Ok(())
    }
}

fn transport_io(path: &Path, e: std::io::Error) -> RelayError {
    RelayError::Transport(format!("{}: {e}", path.display()))
}
