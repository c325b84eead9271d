//! Integration tests for inbound ingestion through the queue consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use relaymail::error::{RelayError, Result};
use relaymail::ingest::{receive_inbound, InboundIngestionJob, InboundMessage};
use relaymail::model::Email;
use relaymail::queue::{publish_json, MemoryQueue, Outcome, QueueConsumer, SpoolQueue};
use relaymail::store::fs::{FsArchive, FsBlobStore};
use relaymail::store::memory::{MemoryArchive, MemoryBlobStore};
use relaymail::store::{BlobStore, EmailArchive};

const SIMPLE: &str = include_str!("fixtures/simple.eml");
const MULTIPART: &str = include_str!("fixtures/multipart.eml");

/// Archive whose writes fail while `down` is set.
#[derive(Default)]
struct FlakyArchive {
    inner: MemoryArchive,
    down: AtomicBool,
}

impl EmailArchive for FlakyArchive {
    fn upsert(&self, resource_id: &str, email: &Email) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RelayError::Storage("archive unavailable".into()));
        }
        self.inner.upsert(resource_id, email)
    }

    fn get(&self, resource_id: &str) -> Result<Option<Email>> {
        self.inner.get(resource_id)
    }

    fn count(&self) -> Result<usize> {
        self.inner.count()
    }
}

fn message(resource_id: &str) -> InboundMessage {
    InboundMessage {
        resource_id: resource_id.to_string(),
    }
}

#[test]
fn test_redelivery_yields_one_email() {
    let job = InboundIngestionJob::new(MemoryBlobStore::new(), MemoryArchive::new());

    job.blobs().store_text("r1", SIMPLE).unwrap();
    job.process(message("r1")).unwrap();
    // The broker redelivers after a lost ack and the receiver re-stored the blob.
    job.blobs().store_text("r1", SIMPLE).unwrap();
    job.process(message("r1")).unwrap();

    assert_eq!(job.archive().count().unwrap(), 1);
    let stored = job.archive().get("r1").unwrap().unwrap();
    assert_eq!(stored.from, "server@relay.org");
    assert_eq!(stored.to, vec!["nurse@client.org".to_string()]);
    assert_eq!(stored.cc, vec!["doctor@client.org".to_string()]);
    assert_eq!(stored.subject, "Weekly schedule");
    assert!(stored.body.contains("vaccinations"));
}

#[test]
fn test_persist_failure_keeps_blob_for_redelivery() {
    let archive = FlakyArchive::default();
    archive.down.store(true, Ordering::SeqCst);
    let job = InboundIngestionJob::new(MemoryBlobStore::new(), archive);
    job.blobs().store_text("r1", SIMPLE).unwrap();

    let mut queue = MemoryQueue::new();
    publish_json(&mut queue, &message("r1")).unwrap();
    let mut consumer = QueueConsumer::new(queue);
    let mut process = |m: InboundMessage| job.process(m);

    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Unacked);
    assert!(job.blobs().contains("r1"));
    assert_eq!(job.archive().count().unwrap(), 0);
    assert_eq!(consumer.source().inflight_len(), 1);

    job.archive().down.store(false, Ordering::SeqCst);
    consumer.source_mut().expire_leases();
    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Acked);
    assert!(!job.blobs().contains("r1"));
    assert_eq!(job.archive().count().unwrap(), 1);
    assert!(consumer.source().is_empty());
}

#[test]
fn test_missing_blob_is_left_unacked() {
    let job = InboundIngestionJob::new(MemoryBlobStore::new(), MemoryArchive::new());

    let err = job.process(message("gone")).unwrap_err();
    assert!(matches!(err, RelayError::NotFound(ref key) if key == "gone"));
    assert!(err.is_storage());

    let mut queue = MemoryQueue::new();
    publish_json(&mut queue, &message("gone")).unwrap();
    let mut consumer = QueueConsumer::new(queue);
    let outcome = consumer
        .run_once(&mut |m: InboundMessage| job.process(m))
        .unwrap();

    assert_eq!(outcome, Outcome::Unacked);
    assert_eq!(consumer.source().inflight_len(), 1);
    assert_eq!(job.archive().count().unwrap(), 0);
}

#[test]
fn test_unparseable_message_is_dead_lettered_after_max_deliveries() {
    let job = InboundIngestionJob::new(MemoryBlobStore::new(), MemoryArchive::new());
    job.blobs().store_text("junk", "\r\n\r\n").unwrap();

    let mut queue = MemoryQueue::new();
    publish_json(&mut queue, &message("junk")).unwrap();
    let mut consumer = QueueConsumer::new(queue).with_max_deliveries(3);
    let mut process = |m: InboundMessage| job.process(m);

    for _ in 0..2 {
        assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Unacked);
        consumer.source_mut().expire_leases();
    }
    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::DeadLettered);

    assert_eq!(consumer.source().dead_len(), 1);
    assert!(consumer.source().dead_reasons()[0].contains("junk"));
    assert!(consumer.source().is_empty());
    // Kept for operators to inspect.
    assert!(job.blobs().contains("junk"));
    assert_eq!(job.archive().count().unwrap(), 0);
}

#[test]
fn test_malformed_payload_is_dead_lettered() {
    let job = InboundIngestionJob::new(MemoryBlobStore::new(), MemoryArchive::new());
    let mut queue = MemoryQueue::new();
    relaymail::queue::MessageSink::publish(&mut queue, r#"{"resource":"x"}"#).unwrap();

    let mut consumer = QueueConsumer::new(queue);
    let outcome = consumer
        .run_once(&mut |m: InboundMessage| job.process(m))
        .unwrap();
    assert_eq!(outcome, Outcome::DeadLettered);
    assert!(consumer.source().dead_reasons()[0].starts_with("malformed payload"));
}

#[test]
fn test_end_to_end_through_spool() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FsBlobStore::new(dir.path().join("blobs"));
    let mut queue = SpoolQueue::open(dir.path().join("queue"), Duration::from_secs(300)).unwrap();

    let simple_id = receive_inbound(&blobs, &mut queue, SIMPLE).unwrap();
    let multipart_id = receive_inbound(&blobs, &mut queue, MULTIPART).unwrap();
    assert_ne!(simple_id, multipart_id);
    assert_eq!(queue.ready_len().unwrap(), 2);

    let job = InboundIngestionJob::new(blobs, FsArchive::new(dir.path().join("archive")));
    let mut consumer = QueueConsumer::new(queue);
    let mut process = |m: InboundMessage| job.process(m);
    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Acked);
    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Acked);
    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Idle);

    assert_eq!(consumer.source().ready_len().unwrap(), 0);
    assert_eq!(consumer.source().inflight_len().unwrap(), 0);
    assert_eq!(job.archive().count().unwrap(), 2);
    assert!(matches!(
        job.blobs().fetch_text(&simple_id),
        Err(RelayError::NotFound(_))
    ));

    let report = job.archive().get(&multipart_id).unwrap().unwrap();
    assert_eq!(report.resource_id.as_deref(), Some(multipart_id.as_str()));
    assert_eq!(report.subject, "Monthly report");
    // The referenced logo is embedded, not attached.
    assert!(report.body.contains("data:image/png;base64,iVBORw0KGgo="));
    assert!(!report.body.contains("cid:logo@relay"));
    assert!(report.inline_images.is_empty());
    assert_eq!(report.attachments.len(), 1);
    assert_eq!(report.attachments[0].filename, "report.pdf");
    assert_eq!(report.attachments[0].content_type, "application/pdf");
    assert_eq!(report.attachments[0].content, b"%PDF-1.4\n");
}

#[test]
fn test_unacked_spool_message_is_redelivered_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FsBlobStore::new(dir.path().join("blobs"));
    let mut queue = SpoolQueue::open(dir.path().join("queue"), Duration::ZERO).unwrap();
    let resource_id = receive_inbound(&blobs, &mut queue, SIMPLE).unwrap();

    let archive = FlakyArchive::default();
    archive.down.store(true, Ordering::SeqCst);
    let job = InboundIngestionJob::new(blobs, archive);
    let mut consumer = QueueConsumer::new(queue);
    let mut process = |m: InboundMessage| job.process(m);

    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Unacked);
    job.archive().down.store(false, Ordering::SeqCst);
    assert_eq!(consumer.run_once(&mut process).unwrap(), Outcome::Acked);

    assert_eq!(job.archive().count().unwrap(), 1);
    assert!(job.archive().get(&resource_id).unwrap().is_some());
}

#[test]
fn test_corrupt_spool_entry_does_not_stop_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FsBlobStore::new(dir.path().join("blobs"));
    let mut queue = SpoolQueue::open(dir.path().join("queue"), Duration::from_secs(300)).unwrap();
    // A half-written envelope that sorts ahead of every real message.
    std::fs::write(
        dir.path().join("queue").join("ready").join("00000000000000000000.json"),
        "{\"id\":\"trunc",
    )
    .unwrap();
    let resource_id = receive_inbound(&blobs, &mut queue, SIMPLE).unwrap();

    let job = InboundIngestionJob::new(blobs, MemoryArchive::new());
    let mut consumer = QueueConsumer::new(queue).with_poll_interval(Duration::ZERO);
    let shutdown = consumer.shutdown_flag();

    let stats = consumer
        .run(|m: InboundMessage| {
            job.process(m)?;
            shutdown.store(true, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

    assert_eq!(stats.acked, 1);
    assert_eq!(stats.broker_errors, 0);
    assert!(job.archive().get(&resource_id).unwrap().is_some());
    assert_eq!(consumer.source().dead_len().unwrap(), 1);
    assert_eq!(consumer.source().ready_len().unwrap(), 0);
}
