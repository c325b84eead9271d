//! Generic at-least-once queue consumption.
//!
//! [`QueueConsumer`] takes one message at a time from a [`MessageSource`],
//! hands the decoded payload to a processing function, and acknowledges it
//! only when that function succeeds. Anything else leaves the message with the
//! broker, which redelivers it once its visibility timeout expires. The
//! consumer never retries by itself.

pub mod memory;
pub mod spool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::error::Result;

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

/// A message claimed from a broker, invisible to other consumers until it is
/// acknowledged or its lease expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker receipt used to acknowledge this delivery.
    pub id: String,
    /// JSON payload.
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

/// The consuming side of a broker.
pub trait MessageSource {
    /// Claim the next visible message, or `None` when nothing is visible.
    fn dequeue(&mut self) -> Result<Option<Delivery>>;

    /// Remove a successfully processed message for good.
    fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Move a message aside so it is never delivered again.
    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<()>;
}

/// The publishing side of a broker.
pub trait MessageSink {
    /// Enqueue a raw JSON payload. Returns the message id.
    fn publish(&mut self, body: &str) -> Result<String>;
}

/// Serialize `message` as JSON and publish it.
pub fn publish_json<Q: MessageSink + ?Sized, M: Serialize>(queue: &mut Q, message: &M) -> Result<String> {
    let body = serde_json::to_string(message)?;
    queue.publish(&body)
}

/// What happened to the message handled by [`QueueConsumer::run_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No message was visible.
    Idle,
    Acked,
    /// Processing failed; the broker will redeliver.
    Unacked,
    DeadLettered,
}

/// Totals over the lifetime of a [`QueueConsumer::run`] loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub unacked: u64,
    pub dead_lettered: u64,
    /// Polls that failed inside the broker itself.
    pub broker_errors: u64,
}

/// Drains a [`MessageSource`] through a processing function.
pub struct QueueConsumer<Q> {
    source: Q,
    max_deliveries: u32,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    span: Span,
}

impl<Q: MessageSource> QueueConsumer<Q> {
    pub fn new(source: Q) -> Self {
        Self {
            source,
            max_deliveries: 5,
            poll_interval: Duration::from_secs(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            span: info_span!("queue"),
        }
    }

    /// Dead-letter a failing message once it has been delivered this many times.
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Sleep between polls of an empty queue.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Share a stop flag; [`QueueConsumer::run`] returns once it is set.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Log inside `span` instead of the default `queue` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn source(&self) -> &Q {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut Q {
        &mut self.source
    }

    /// Process at most one message.
    pub fn run_once<M, F>(&mut self, process: &mut F) -> Result<Outcome>
    where
        M: DeserializeOwned,
        F: FnMut(M) -> Result<()>,
    {
        let _span = self.span.clone().entered();

        let Some(delivery) = self.source.dequeue()? else {
            return Ok(Outcome::Idle);
        };
        debug!(
            id = %delivery.id,
            delivery_count = delivery.delivery_count,
            "Dequeued message"
        );

        let message: M = match serde_json::from_str(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                error!(id = %delivery.id, error = %e, "Malformed message payload; dead-lettering");
                self.source
                    .dead_letter(&delivery, &format!("malformed payload: {e}"))?;
                return Ok(Outcome::DeadLettered);
            }
        };

        match process(message) {
            Ok(()) => {
                self.source.ack(&delivery)?;
                Ok(Outcome::Acked)
            }
            Err(e) if delivery.delivery_count >= self.max_deliveries => {
                error!(
                    id = %delivery.id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Giving up on message; dead-lettering"
                );
                self.source.dead_letter(&delivery, &e.to_string())?;
                Ok(Outcome::DeadLettered)
            }
            Err(e) => {
                warn!(
                    id = %delivery.id,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Processing failed; leaving message for redelivery"
                );
                Ok(Outcome::Unacked)
            }
        }
    }

    /// Consume until the shutdown flag is set.
    ///
    /// Neither processing nor broker errors end the loop. A broker error is
    /// logged and retried after one poll interval.
    pub fn run<M, F>(&mut self, mut process: F) -> Result<ConsumerStats>
    where
        M: DeserializeOwned,
        F: FnMut(M) -> Result<()>,
    {
        info!(max_deliveries = self.max_deliveries, "Queue consumer started");
        let mut stats = ConsumerStats::default();

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.run_once(&mut process) {
                Ok(Outcome::Idle) => std::thread::sleep(self.poll_interval),
                Ok(Outcome::Acked) => stats.acked += 1,
                Ok(Outcome::Unacked) => stats.unacked += 1,
                Ok(Outcome::DeadLettered) => stats.dead_lettered += 1,
                Err(e) => {
                    error!(error = %e, "Broker error; retrying after poll interval");
                    stats.broker_errors += 1;
                    std::thread::sleep(self.poll_interval);
                }
            }
        }

        info!(
            acked = stats.acked,
            unacked = stats.unacked,
            dead_lettered = stats.dead_lettered,
            broker_errors = stats.broker_errors,
            "Queue consumer stopped"
        );
        Ok(stats)
    }
}
