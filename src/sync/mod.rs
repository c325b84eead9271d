//! One upload-then-download sync cycle between the local mailbox and a
//! remote transport.
//!
//! The engine keeps no state of its own: every cycle re-reads the pending
//! emails and users from the store, so a failed phase is retried simply by
//! running the next cycle.

pub mod transport;

use tracing::{debug, info, info_span, warn, Span};

use crate::error::Result;
use crate::model::{Email, User};
use crate::store::{LocalStore, SyncBatch};

pub use transport::FsTransport;

/// The remote side of a sync cycle.
pub trait Transport {
    /// Send pending emails and users. Returns the emails the remote accepted.
    fn upload(&mut self, emails: &[Email], users: &[User]) -> Result<Vec<Email>>;

    /// Fetch mail waiting for this client without removing it remotely.
    fn download(&mut self) -> Result<Vec<Email>>;

    /// Tell the remote that emails from the last `download` are stored locally.
    fn confirm_download(&mut self, _emails: &[Email]) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one [`SyncEngine::run_cycle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Emails the remote accepted and that are now marked sent.
    pub uploaded: usize,
    /// Emails created locally from the download.
    pub downloaded: usize,
    pub upload_failed: bool,
    pub download_failed: bool,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        !self.upload_failed && !self.download_failed
    }
}

/// Runs sync cycles for one client.
pub struct SyncEngine<S, T> {
    store: S,
    transport: T,
    span: Span,
}

impl<S: LocalStore, T: Transport> SyncEngine<S, T> {
    pub fn new(store: S, transport: T) -> Self {
        Self {
            store,
            transport,
            span: info_span!("sync"),
        }
    }

    /// Log inside `span` instead of the default `sync` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_parts(self) -> (S, T) {
        (self.store, self.transport)
    }

    /// Upload, then download. A failure in one phase is logged and does not
    /// stop the other.
    pub fn run_cycle(&mut self) -> CycleReport {
        let _span = self.span.clone().entered();
        let mut report = CycleReport::default();

        match self.upload() {
            Ok(count) => report.uploaded = count,
            Err(e) => {
                warn!(error = %e, "Unable to upload emails");
                report.upload_failed = true;
            }
        }

        match self.download() {
            Ok(count) => report.downloaded = count,
            Err(e) => {
                warn!(error = %e, "Unable to download emails");
                report.download_failed = true;
            }
        }

        info!(
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            upload_failed = report.upload_failed,
            download_failed = report.download_failed,
            "Sync cycle finished"
        );
        report
    }

    fn upload(&mut self) -> Result<usize> {
        let pending = self.store.pending()?;
        let users = self.store.pending_users()?;
        if pending.is_empty() && users.is_empty() {
            debug!("Nothing to upload");
            return Ok(0);
        }

        debug!(emails = pending.len(), users = users.len(), "Uploading");
        let accepted = self.transport.upload(&pending, &users)?;

        // Only ever mark what was offered in this cycle.
        let accepted: Vec<Email> = accepted
            .into_iter()
            .filter(|a| pending.iter().any(|p| p.uid == a.uid))
            .collect();

        let mut batch = SyncBatch::new();
        batch.mark_sent(&accepted);
        batch.mark_synced(&users);
        self.store.commit(batch)?;

        Ok(accepted.len())
    }

    fn download(&mut self) -> Result<usize> {
        let downloaded = self.transport.download()?;
        if downloaded.is_empty() {
            debug!("Nothing to download");
            return Ok(0);
        }

        self.store.create(&downloaded)?;

        if let Err(e) = self.transport.confirm_download(&downloaded) {
            warn!(error = %e, "Could not confirm download; remote will offer it again");
        }
        Ok(downloaded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::store::memory::MemoryMailbox;
    use crate::store::{EmailStore, UserStore};
    use chrono::Utc;

    #[derive(Default)]
    struct ScriptedTransport {
        fail_upload: bool,
        fail_download: bool,
        accept_first: Option<usize>,
        inbound: Vec<Email>,
        uploads: Vec<(Vec<String>, Vec<String>)>,
        confirmed: usize,
    }

    impl Transport for ScriptedTransport {
        fn upload(&mut self, emails: &[Email], users: &[User]) -> Result<Vec<Email>> {
            self.uploads.push((
                emails.iter().map(|e| e.uid.clone()).collect(),
                users.iter().map(|u| u.email.clone()).collect(),
            ));
            if self.fail_upload {
                return Err(RelayError::Transport("link dropped".into()));
            }
            let n = self.accept_first.unwrap_or(emails.len());
            Ok(emails.iter().take(n).cloned().collect())
        }

        fn download(&mut self) -> Result<Vec<Email>> {
            if self.fail_download {
                return Err(RelayError::Transport("link dropped".into()));
            }
            Ok(self.inbound.clone())
        }

        fn confirm_download(&mut self, emails: &[Email]) -> Result<()> {
            self.confirmed += emails.len();
            Ok(())
        }
    }

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
    fn test_empty_store_skips_upload() {
        let mut engine = SyncEngine::new(MemoryMailbox::new(), ScriptedTransport::default());
        let report = engine.run_cycle();
        assert!(report.is_success());
        assert!(engine.transport().uploads.is_empty());
    }

    #[test]
    fn test_upload_failure_still_downloads() {
        let mut mailbox = MemoryMailbox::new();
        mailbox.compose(email("out"));
        let inbound = email("in");
        let transport = ScriptedTransport {
            fail_upload: true,
            inbound: vec![inbound.clone()],
            ..Default::default()
        };

        let mut engine = SyncEngine::new(mailbox, transport);
        let report = engine.run_cycle();

        assert!(report.upload_failed);
        assert!(!report.download_failed);
        assert_eq!(report.downloaded, 1);
        assert!(engine.store().find(&inbound.uid).is_some());
        assert_eq!(engine.transport().confirmed, 1);
    }

    #[test]
    fn test_download_failure_does_not_touch_store() {
        let transport = ScriptedTransport {
            fail_download: true,
            ..Default::default()
        };
        let mut engine = SyncEngine::new(MemoryMailbox::new(), transport);
        let report = engine.run_cycle();
        assert!(report.download_failed);
        assert!(engine.store().emails().is_empty());
    }

    #[test]
    fn test_users_marked_synced_after_upload() {
        let mut mailbox = MemoryMailbox::new();
        mailbox.add_user(User::new("new@client.org"));
        let mut engine = SyncEngine::new(mailbox, ScriptedTransport::default());

        engine.run_cycle();
        assert!(engine.store().pending_users().unwrap().is_empty());
        assert_eq!(engine.transport().uploads.len(), 1);

        engine.run_cycle();
        assert_eq!(engine.transport().uploads.len(), 1);
    }

    #[test]
    fn test_foreign_accepted_email_is_ignored() {
        struct Liar;
        impl Transport for Liar {
            fn upload(&mut self, _: &[Email], _: &[User]) -> Result<Vec<Email>> {
                Ok(vec![email("never offered")])
            }
            fn download(&mut self) -> Result<Vec<Email>> {
                Ok(Vec::new())
            }
        }

        let mut mailbox = MemoryMailbox::new();
        mailbox.compose(email("mine"));
        let mut engine = SyncEngine::new(mailbox, Liar);
        let report = engine.run_cycle();
        assert_eq!(report.uploaded, 0);
        assert_eq!(engine.store().pending().unwrap().len(), 1);
    }
}
