//! Durable stores: the client mailbox (emails and users) and the server-side
//! blob store and email archive.
//!
//! The sync engine and the ingestion job only see the traits defined here.
//! [`memory`] holds in-process implementations, [`fs`] directory-backed ones.

pub mod fs;
pub mod memory;

use crate::error::Result;
use crate::model::{Email, User};

/// Local email persistence on the client.
pub trait EmailStore {
    /// Every email not yet uploaded (`sent == false`). Unbounded.
    fn pending(&self) -> Result<Vec<Email>>;

    /// Insert emails. An email whose uid is already stored is skipped, so
    /// re-downloading the same message never duplicates it.
    fn create(&mut self, emails: &[Email]) -> Result<()>;
}

/// Local user persistence on the client.
pub trait UserStore {
    /// Every user with `synced == false`.
    fn pending_users(&self) -> Result<Vec<User>>;
}

/// The status changes produced by one successful upload.
///
/// Applied through [`LocalStore::commit`] so that "emails marked sent" and
/// "users marked synced" become visible together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBatch {
    sent: Vec<String>,
    synced: Vec<String>,
}

impl SyncBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record emails (by uid) to flag as sent.
    pub fn mark_sent(&mut self, emails: &[Email]) {
        self.sent.extend(emails.iter().map(|e| e.uid.clone()));
    }

    /// Record users (by address) to flag as synced.
    pub fn mark_synced(&mut self, users: &[User]) {
        self.synced.extend(users.iter().map(|u| u.email.clone()));
    }

    pub fn sent_uids(&self) -> &[String] {
        &self.sent
    }

    pub fn synced_users(&self) -> &[String] {
        &self.synced
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.synced.is_empty()
    }
}

/// The client-side store the sync engine runs against.
pub trait LocalStore: EmailStore + UserStore {
    /// Apply a batch of status changes as one commit.
    fn commit(&mut self, batch: SyncBatch) -> Result<()>;
}

/// Transient raw-message storage on the server, keyed by resource id.
pub trait BlobStore {
    /// Fetch a blob as text. A missing key is [`crate::error::RelayError::NotFound`].
    fn fetch_text(&self, key: &str) -> Result<String>;

    fn store_text(&self, key: &str, text: &str) -> Result<()>;

    /// Remove a blob. Deleting a key that is already gone succeeds.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Durable structured-email storage on the server.
pub trait EmailArchive {
    /// Insert or overwrite the email stored under `resource_id`.
    fn upsert(&self, resource_id: &str, email: &Email) -> Result<()>;

    fn get(&self, resource_id: &str) -> Result<Option<Email>>;

    fn count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_sync_batch_collects_ids() {
        let email = Email::new("a@x.org", vec!["b@x.org".into()], "s", "b", Utc::now());
        let mut batch = SyncBatch::new();
        assert!(batch.is_empty());

        batch.mark_sent(std::slice::from_ref(&email));
        batch.mark_synced(&[User::new("a@x.org")]);

        assert_eq!(batch.sent_uids(), [email.uid.clone()]);
        assert_eq!(batch.synced_users(), ["a@x.org".to_string()]);
        assert!(!batch.is_empty());
    }
}
