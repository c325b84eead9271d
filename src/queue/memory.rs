//! In-process broker with explicit lease expiry, for tests and embedding.

use std::collections::{HashMap, VecDeque};

use crate::error::{RelayError, Result};
use crate::queue::{Delivery, MessageSink, MessageSource};

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: String,
    delivery_count: u32,
}

/// A FIFO queue whose unacknowledged messages stay leased until
/// [`MemoryQueue::expire_leases`] stands in for the visibility timeout.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    ready: VecDeque<Stored>,
    inflight: HashMap<String, Stored>,
    dead: Vec<(Stored, String)>,
    next_id: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages not yet acknowledged or dead-lettered (visible or leased).
    pub fn len(&self) -> usize {
        self.ready.len() + self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn dead_len(&self) -> usize {
        self.dead.len()
    }

    /// Reasons recorded for dead-lettered messages, oldest first.
    pub fn dead_reasons(&self) -> Vec<&str> {
        self.dead.iter().map(|(_, reason)| reason.as_str()).collect()
    }

    /// Make every leased message visible again.
    pub fn expire_leases(&mut self) {
        let mut expired: Vec<Stored> = self.inflight.drain().map(|(_, m)| m).collect();
        expired.sort_by(|a, b| b.id.cmp(&a.id));
        for message in expired {
            self.ready.push_front(message);
        }
    }
}

impl MessageSource for MemoryQueue {
    fn dequeue(&mut self) -> Result<Option<Delivery>> {
        let Some(mut message) = self.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        let delivery = Delivery {
            id: message.id.clone(),
            body: message.body.clone(),
            delivery_count: message.delivery_count,
        };
        self.inflight.insert(message.id.clone(), message);
        Ok(Some(delivery))
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.inflight.remove(&delivery.id);
        Ok(())
    }

    fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<()> {
        let message = self
            .inflight
            .remove(&delivery.id)
            .ok_or_else(|| RelayError::Queue(format!("message {} is not leased", delivery.id)))?;
        self.dead.push((message, reason.to_string()));
        Ok(())
    }
}

impl MessageSink for MemoryQueue {
    fn publish(&mut self, body: &str) -> Result<String> {
        self.next_id += 1;
        let id = format!("{:020}", self.next_id);
        self.ready.push_back(Stored {
            id: id.clone(),
            body: body.to_string(),
            delivery_count: 0,
        });
        Ok(id)
    }
}
