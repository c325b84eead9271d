//! Directory-backed stores.
//!
//! Every write goes to a uniquely named temporary file in the target directory
//! and is renamed into place, so readers see either the old or the new
//! content and concurrent writers of the same key never interleave.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::model::{Email, User};
use crate::store::memory::{apply_batch, insert_new};
use crate::store::{BlobStore, EmailArchive, EmailStore, LocalStore, SyncBatch, UserStore};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a temporary sibling and an atomic rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RelayError::Storage(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| RelayError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = fs::File::create(&tmp).map_err(|e| RelayError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| RelayError::io(&tmp, e))?;
    file.sync_all().map_err(|e| RelayError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        RelayError::io(path, e)
    })
}

/// Reject keys that would escape the store directory.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0'])
    {
        return Err(RelayError::Storage(format!("invalid storage key '{key}'")));
    }
    Ok(())
}

// ── Client mailbox ──────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct MailboxDocument {
    #[serde(default)]
    emails: Vec<Email>,
    #[serde(default)]
    users: Vec<User>,
}

/// A client mailbox persisted as a single JSON document.
///
/// Every mutation rewrites the whole document atomically, which makes a
/// [`SyncBatch`] commit all-or-nothing.
#[derive(Debug)]
pub struct FsMailbox {
    path: PathBuf,
    doc: MailboxDocument,
}

impl FsMailbox {
    /// Open the mailbox at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MailboxDocument::default(),
            Err(e) => return Err(RelayError::io(&path, e)),
        };
        debug!(
            path = %path.display(),
            emails = doc.emails.len(),
            users = doc.users.len(),
            "Opened mailbox"
        );
        Ok(Self { path, doc })
    }

    /// Queue a locally composed email for upload.
    pub fn compose(&mut self, mut email: Email) -> Result<()> {
        email.ensure_uid();
        email.sent = false;
        self.doc.emails.push(email);
        self.save()
    }

    pub fn add_user(&mut self, user: User) -> Result<()> {
        if !self.doc.users.iter().any(|u| u.email == user.email) {
            self.doc.users.push(user);
        }
        self.save()
    }

    pub fn emails(&self) -> &[Email] {
        &self.doc.emails
    }

    pub fn users(&self) -> &[User] {
        &self.doc.users
    }

    fn save(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.doc)?;
        write_atomic(&self.path, &data)
    }
}

impl EmailStore for FsMailbox {
    fn pending(&self) -> Result<Vec<Email>> {
        Ok(self.doc.emails.iter().filter(|e| !e.sent).cloned().collect())
    }

    fn create(&mut self, emails: &[Email]) -> Result<()> {
        let before = self.doc.emails.len();
        insert_new(&mut self.doc.emails, emails);
        if self.doc.emails.len() == before {
            return Ok(());
        }
        self.save()
    }
}

impl UserStore for FsMailbox {
    fn pending_users(&self) -> Result<Vec<User>> {
        Ok(self.doc.users.iter().filter(|u| !u.synced).cloned().collect())
    }
}

impl LocalStore for FsMailbox {
    fn commit(&mut self, batch: SyncBatch) -> Result<()> {
        let mut emails = self.doc.emails.clone();
        let mut users = self.doc.users.clone();
        apply_batch(&mut emails, &mut users, &batch);

        let staged = MailboxDocument { emails, users };
        let data = serde_json::to_vec_pretty(&staged)?;
        write_atomic(&self.path, &data)?;

        // Only adopt the new state once it is on disk.
        self.doc = staged;
        Ok(())
    }
}

// ── Server blob store ───────────────────────────────────────────

/// Raw-message blobs stored as one text file per key.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn fetch_text(&self, key: &str) -> Result<String> {
        let path = self.path_for(key)?;
        fs::read_to_string(&path).map_err(|e| RelayError::storage(&path, key, e))
    }

    fn store_text(&self, key: &str, text: &str) -> Result<()> {
        let path = self.path_for(key)?;
        write_atomic(&path, text.as_bytes())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::io(&path, e)),
        }
    }
}

// ── Server email archive ────────────────────────────────────────

/// Structured emails stored as `<resource_id>.json`.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, resource_id: &str) -> Result<PathBuf> {
        validate_key(resource_id)?;
        Ok(self.root.join(format!("{resource_id}.json")))
    }
}

impl EmailArchive for FsArchive {
    fn upsert(&self, resource_id: &str, email: &Email) -> Result<()> {
        let path = self.path_for(resource_id)?;
        let data = serde_json::to_vec(email)?;
        write_atomic(&path, &data)
    }

    fn get(&self, resource_id: &str) -> Result<Option<Email>> {
        let path = self.path_for(resource_id)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::io(&path, e)),
        }
    }

    fn count(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(RelayError::io(&self.root, e)),
        };
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| RelayError::io(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') && name.ends_with(".json") {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn email(subject: &str) -> Email {
        Email::new(
            "me@client.org",
            vec!["you@remote.org".into()],
            subject,
            "body",
            Utc::now(),
        )
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("abc-123").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key(".hidden").is_err());
    }

    #[test]
    fn test_mailbox_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailbox.json");

        let a = email("a");
        {
            let mut mailbox = FsMailbox::open(&path).unwrap();
            mailbox.compose(a.clone()).unwrap();
            mailbox.add_user(User::new("me@client.org")).unwrap();
            let mut batch = SyncBatch::new();
            batch.mark_sent(std::slice::from_ref(&a));
            batch.mark_synced(&[User::new("me@client.org")]);
            mailbox.commit(batch).unwrap();
        }

        let mailbox = FsMailbox::open(&path).unwrap();
        assert!(mailbox.pending().unwrap().is_empty());
        assert!(mailbox.pending_users().unwrap().is_empty());
        assert!(mailbox.emails()[0].sent);
    }

    #[test]
    fn test_blob_store_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path());
        blobs.store_text("r1", "raw mime").unwrap();
        assert_eq!(blobs.fetch_text("r1").unwrap(), "raw mime");
        blobs.delete("r1").unwrap();
        assert!(matches!(blobs.fetch_text("r1"), Err(RelayError::NotFound(_))));
        blobs.delete("r1").unwrap();
    }

    #[test]
    fn test_archive_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::new(dir.path());
        assert_eq!(archive.count().unwrap(), 0);
        archive.upsert("r1", &email("x")).unwrap();
        archive.upsert("r1", &email("x")).unwrap();
        assert_eq!(archive.count().unwrap(), 1);
        assert_eq!(archive.get("r1").unwrap().unwrap().subject, "x");
        assert!(archive.get("r2").unwrap().is_none());
    }
}
