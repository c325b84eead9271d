//! In-memory stores, for tests and for embedding the engines in a host process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{RelayError, Result};
use crate::model::{Email, User};
use crate::store::{BlobStore, EmailArchive, EmailStore, LocalStore, SyncBatch, UserStore};

/// A client mailbox held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryMailbox {
    emails: Vec<Email>,
    users: Vec<User>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a locally composed email for upload.
    pub fn compose(&mut self, mut email: Email) {
        email.ensure_uid();
        email.sent = false;
        self.emails.push(email);
    }

    pub fn add_user(&mut self, user: User) {
        self.users.push(user);
    }

    pub fn emails(&self) -> &[Email] {
        &self.emails
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn find(&self, uid: &str) -> Option<&Email> {
        self.emails.iter().find(|e| e.uid == uid)
    }
}

impl EmailStore for MemoryMailbox {
    fn pending(&self) -> Result<Vec<Email>> {
        Ok(self.emails.iter().filter(|e| !e.sent).cloned().collect())
    }

    fn create(&mut self, emails: &[Email]) -> Result<()> {
        insert_new(&mut self.emails, emails);
        Ok(())
    }
}

impl UserStore for MemoryMailbox {
    fn pending_users(&self) -> Result<Vec<User>> {
        Ok(self.users.iter().filter(|u| !u.synced).cloned().collect())
    }
}

impl LocalStore for MemoryMailbox {
    fn commit(&mut self, batch: SyncBatch) -> Result<()> {
        apply_batch(&mut self.emails, &mut self.users, &batch);
        Ok(())
    }
}

/// Append emails whose uid is not present yet.
pub(crate) fn insert_new(existing: &mut Vec<Email>, incoming: &[Email]) {
    for email in incoming {
        let mut email = email.clone();
        email.ensure_uid();
        if !existing.iter().any(|e| e.uid == email.uid) {
            existing.push(email);
        }
    }
}

/// Flip the `sent` / `synced` flags named by a batch.
pub(crate) fn apply_batch(emails: &mut [Email], users: &mut [User], batch: &SyncBatch) {
    for email in emails.iter_mut() {
        if batch.sent_uids().contains(&email.uid) {
            email.sent = true;
        }
    }
    for user in users.iter_mut() {
        if batch.synced_users().contains(&user.email) {
            user.synced = true;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| RelayError::Storage("in-memory store lock poisoned".into()))
}

/// Blob store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.blobs)
            .map(|blobs| blobs.contains_key(key))
            .unwrap_or(false)
    }
}

impl BlobStore for MemoryBlobStore {
    fn fetch_text(&self, key: &str) -> Result<String> {
        lock(&self.blobs)?
            .get(key)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(key.to_string()))
    }

    fn store_text(&self, key: &str, text: &str) -> Result<()> {
        lock(&self.blobs)?.insert(key.to_string(), text.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.blobs)?.remove(key);
        Ok(())
    }
}

/// Email archive backed by a `HashMap` keyed by resource id.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    emails: Mutex<HashMap<String, Email>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmailArchive for MemoryArchive {
    fn upsert(&self, resource_id: &str, email: &Email) -> Result<()> {
        lock(&self.emails)?.insert(resource_id.to_string(), email.clone());
        Ok(())
    }

    fn get(&self, resource_id: &str) -> Result<Option<Email>> {
        Ok(lock(&self.emails)?.get(resource_id).cloned())
    }

    fn count(&self) -> Result<usize> {
        Ok(lock(&self.emails)?.len())
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
    fn test_pending_excludes_sent() {
        let mut mailbox = MemoryMailbox::new();
        let a = email("a");
        let b = email("b");
        mailbox.compose(a.clone());
        mailbox.compose(b.clone());

        let mut batch = SyncBatch::new();
        batch.mark_sent(std::slice::from_ref(&a));
        mailbox.commit(batch).unwrap();

        let pending = mailbox.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uid, b.uid);
    }

    #[test]
    fn test_create_skips_known_uids() {
        let mut mailbox = MemoryMailbox::new();
        let c = email("c");
        mailbox.create(std::slice::from_ref(&c)).unwrap();
        mailbox.create(std::slice::from_ref(&c)).unwrap();
        assert_eq!(mailbox.emails().len(), 1);
    }

    #[test]
    fn test_commit_marks_users_synced() {
        let mut mailbox = MemoryMailbox::new();
        mailbox.add_user(User::new("one@client.org"));
        mailbox.add_user(User::new("two@client.org"));

        let mut batch = SyncBatch::new();
        batch.mark_synced(&[User::new("one@client.org")]);
        mailbox.commit(batch).unwrap();

        let pending = mailbox.pending_users().unwrap();
        assert_eq!(pending, vec![User::new("two@client.org")]);
    }

    #[test]
    fn test_blob_store_not_found() {
        let blobs = MemoryBlobStore::new();
        assert!(matches!(
            blobs.fetch_text("missing"),
            Err(RelayError::NotFound(_))
        ));
        blobs.store_text("k", "v").unwrap();
        assert_eq!(blobs.fetch_text("k").unwrap(), "v");
        blobs.delete("k").unwrap();
        blobs.delete("k").unwrap();
        assert!(!blobs.contains("k"));
    }

    #[test]
    fn test_archive_upsert_overwrites() {
        let archive = MemoryArchive::new();
        archive.upsert("r1", &email("first")).unwrap();
        archive.upsert("r1", &email("second")).unwrap();
        assert_eq!(archive.count().unwrap(), 1);
        assert_eq!(archive.get("r1").unwrap().unwrap().subject, "second");
    }
}
