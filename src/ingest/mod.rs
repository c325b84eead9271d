//! Server-side ingestion of inbound MIME messages.
//!
//! A receiver stores the raw message as a blob and enqueues its resource id
//! ([`receive_inbound`]). [`InboundIngestionJob::process`] later turns the blob
//! into a structured [`Email`](crate::model::Email), upserts it, and only then
//! deletes the blob. Redelivery of the same resource id overwrites the same
//! record, so at-least-once delivery never duplicates mail.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, info_span, warn, Span};

use crate::error::Result;
use crate::parser::mime::{format_attachments, format_inline_images, parse_mime_email};
use crate::queue::{publish_json, MessageSink};
use crate::store::{BlobStore, EmailArchive};

/// Queue payload: `{"resource_id": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub resource_id: String,
}

/// Processing function for the inbound queue.
pub struct InboundIngestionJob<B, A> {
    blobs: B,
    archive: A,
    span: Span,
}

impl<B: BlobStore, A: EmailArchive> InboundIngestionJob<B, A> {
    pub fn new(blobs: B, archive: A) -> Self {
        Self {
            blobs,
            archive,
            span: info_span!("ingest"),
        }
    }

    /// Log inside `span` instead of the default `ingest` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// Fetch, parse, normalize, persist, then delete the raw blob.
    ///
    /// Errors are returned untouched so the consumer leaves the message for
    /// broker redelivery; nothing here retries.
    pub fn process(&self, message: InboundMessage) -> Result<()> {
        let resource_id = message.resource_id.as_str();
        let _span = info_span!(parent: &self.span, "message", resource_id).entered();

        let mime = self
            .blobs
            .fetch_text(resource_id)
            .inspect_err(|e| warn!(error = %e, "Unable to fetch inbound MIME email"))?;
        info!("Fetched inbound MIME email");

        let email = parse_mime_email(&mime, resource_id)
            .inspect_err(|e| error!(error = %e, "Unable to parse inbound MIME email"))?;
        let email = format_attachments(format_inline_images(email));

        self.archive
            .upsert(resource_id, &email)
            .inspect_err(|e| warn!(error = %e, "Unable to store inbound email"))?;
        info!(
            attachments = email.attachments.len(),
            "Stored inbound email"
        );

        self.blobs.delete(resource_id)?;
        info!("Deleted inbound MIME email");
        Ok(())
    }
}

/// Store a raw MIME message and enqueue it for ingestion.
///
/// The resource id is the SHA-256 of the message, so receiving the same
/// message twice lands on the same blob and the same archived record. The
/// blob is written before the queue message so a delivered message always
/// finds its blob.
pub fn receive_inbound<B, Q>(blobs: &B, queue: &mut Q, raw_mime: &str) -> Result<String>
where
    B: BlobStore + ?Sized,
    Q: MessageSink + ?Sized,
{
    let resource_id = format!("{:x}", Sha256::digest(raw_mime.as_bytes()));
    blobs.store_text(&resource_id, raw_mime)?;
    publish_json(
        queue,
        &InboundMessage {
            resource_id: resource_id.clone(),
        },
    )?;
    info!(resource_id = %resource_id, "Received inbound MIME email");
    Ok(resource_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::queue::{MemoryQueue, MessageSource};
    use crate::store::memory::{MemoryArchive, MemoryBlobStore};

    const RAW: &str = "From: sender@example.com\r\n\
To: user@client.org\r\n\
Subject: Greetings\r\n\
\r\n\
Hello!\r\n";

    #[test]
    fn test_process_stores_then_deletes() {
        let job = InboundIngestionJob::new(MemoryBlobStore::new(), MemoryArchive::new());
        job.blobs().store_text("r1", RAW).unwrap();

        job.process(InboundMessage {
            resource_id: "r1".into(),
        })
        .unwrap();

        let stored = job.archive().get("r1").unwrap().unwrap();
        assert_eq!(stored.subject, "Greetings");
        assert_eq!(stored.resource_id.as_deref(), Some("r1"));
        assert!(!job.blobs().contains("r1"));
    }

    #[test]
    fn test_parse_error_keeps_blob() {
        let job = InboundIngestionJob::new(MemoryBlobStore::new(), MemoryArchive::new());
        job.blobs().store_text("bad", "no headers here").unwrap();

        let err = job
            .process(InboundMessage {
                resource_id: "bad".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::Parse { .. }));
        assert!(job.blobs().contains("bad"));
        assert_eq!(job.archive().count().unwrap(), 0);
    }

    #[test]
    fn test_receive_inbound_stores_blob_and_enqueues() {
        let blobs = MemoryBlobStore::new();
        let mut queue = MemoryQueue::new();
        let resource_id = receive_inbound(&blobs, &mut queue, RAW).unwrap();

        assert_eq!(resource_id.len(), 64);
        assert_eq!(blobs.fetch_text(&resource_id).unwrap(), RAW);
        let delivery = queue.dequeue().unwrap().unwrap();
        let message: InboundMessage = serde_json::from_str(&delivery.body).unwrap();
        assert_eq!(message.resource_id, resource_id);
    }

    #[test]
    fn test_queue_payload_shape() {
        let json = serde_json::to_string(&InboundMessage {
            resource_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"resource_id":"abc"}"#);
    }
}
