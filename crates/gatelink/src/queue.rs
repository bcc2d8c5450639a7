//! Outbound message queue.
//!
//! Holds sends issued while no transport is open. Order is global FIFO across all
//! event types. Entries older than `max_age` are dropped before a flush, and a full
//! queue drops its oldest half before accepting another entry.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for the outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Entries held before the oldest half is evicted.
    pub capacity: usize,
    /// Entries older than this are dropped instead of sent, in seconds.
    pub max_age_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            max_age_secs: 300,
        }
    }
}

impl QueueConfig {
    /// Staleness limit.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// A send waiting for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Event type.
    pub event_type: String,
    /// Payload, already converted to a JSON value.
    pub payload: Value,
    /// When the send was issued.
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    /// Create an entry stamped with `now`.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value, now: Instant) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            enqueued_at: now,
        }
    }

    /// Whether the entry is older than `max_age` at `now`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.enqueued_at) > max_age
    }
}

/// Bounded FIFO of pending sends.
#[derive(Debug)]
pub struct MessageQueue {
    config: QueueConfig,
    entries: VecDeque<QueuedMessage>,
    dropped: u64,
}

impl MessageQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries dropped by staleness or overflow since creation.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append an entry. Returns how many old entries were evicted to make room.
    pub fn push(&mut self, message: QueuedMessage) -> usize {
        let evicted = if self.entries.len() >= self.config.capacity {
            let evict = self.entries.len() / 2;
            self.entries.drain(..evict);
            self.dropped += evict as u64;
            warn!(
                evicted = evict,
                remaining = self.entries.len(),
                capacity = self.config.capacity,
                "Outbound queue full, dropped oldest entries"
            );
            evict
        } else {
            0
        };

        self.entries.push_back(message);
        evicted
    }

    /// Put an entry back at the head, e.g. after a failed write during a flush.
    pub fn push_front(&mut self, message: QueuedMessage) {
        self.entries.push_front(message);
    }

    /// Take the oldest entry.
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Drop every entry older than the staleness limit. Returns the number dropped.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let max_age = self.config.max_age();
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_stale(now, max_age));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            self.dropped += evicted as u64;
            debug!(evicted, "Dropped stale queued messages");
        }
        evicted
    }

    /// Iterate pending entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    /// Discard everything. Returns the number discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
