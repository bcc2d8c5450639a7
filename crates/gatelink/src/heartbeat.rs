//! Heartbeat/keepalive mechanism.
//!
//! The monitor is pure bookkeeping; the connection driver owns the timers and asks
//! it what to do when one fires. Every probe gets its own acknowledgement deadline,
//! so probes still outstanding when the next one is sent each count as a miss.

use std::collections::VecDeque;
use std::time::Duration;

use gatelink_proto::control::heartbeat_payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats, in milliseconds.
    pub interval_ms: u64,
    /// How long to wait for an acknowledgement before counting a miss, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Number of missed acks before considering the connection dead.
    pub max_missed_acks: u32,
    /// Close the transport as stale after this long without any inbound frame,
    /// in milliseconds.
    pub idle_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            ack_timeout_ms: 30_000,
            max_missed_acks: 3,
            idle_timeout_ms: 90_000,
        }
    }
}

impl HeartbeatConfig {
    /// Interval between heartbeats.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Idle timeout for the companion connection-timeout timer.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Liveness bookkeeping for the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// When the last probe was sent.
    pub last_sent_at: Option<Instant>,
    /// When the last acknowledgement arrived.
    pub last_ack_at: Option<Instant>,
    /// Consecutive probes that were not acknowledged in time.
    pub missed_count: u32,
}

/// What the driver should do on a heartbeat tick.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatTick {
    /// Send a probe with this payload.
    Ping {
        /// Probe payload carrying the client timestamp and missed count.
        payload: Value,
    },
    /// Too many misses; the connection is dead.
    Dead {
        /// Consecutive misses observed.
        missed: u32,
    },
}

/// Tracks probes, acknowledgements and misses for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    record: HeartbeatRecord,
    ack_deadlines: VecDeque<Instant>,
    next_tick: Option<Instant>,
    last_rtt: Option<Duration>,
    last_server_timestamp: Option<i64>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            record: HeartbeatRecord::default(),
            ack_deadlines: VecDeque::new(),
            next_tick: None,
            last_rtt: None,
            last_server_timestamp: None,
        }
    }

    /// Start monitoring a freshly opened connection.
    pub fn start(&mut self, now: Instant) {
        self.record = HeartbeatRecord::default();
        self.ack_deadlines.clear();
        self.next_tick = Some(now + self.config.interval());
    }

    /// Stop monitoring; pending deadlines are discarded.
    pub fn stop(&mut self) {
        self.next_tick = None;
        self.ack_deadlines.clear();
    }

    /// Check if the monitor is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    /// When the next probe is due.
    #[must_use]
    pub const fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Earliest outstanding acknowledgement deadline.
    #[must_use]
    pub fn next_ack_deadline(&self) -> Option<Instant> {
        self.ack_deadlines.front().copied()
    }

    /// Current bookkeeping.
    #[must_use]
    pub const fn record(&self) -> &HeartbeatRecord {
        &self.record
    }

    /// Get the number of consecutive missed acks.
    #[must_use]
    pub const fn missed_acks(&self) -> u32 {
        self.record.missed_count
    }

    /// Round trip of the most recently acknowledged probe.
    #[must_use]
    pub const fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Server timestamp carried by the most recent acknowledgement.
    #[must_use]
    pub const fn last_server_timestamp(&self) -> Option<i64> {
        self.last_server_timestamp
    }

    fn is_dead(&self) -> bool {
        self.record.missed_count >= self.config.max_missed_acks
    }

    /// Handle a due tick.
    ///
    /// Expired deadlines are counted first; if the miss limit is reached the
    /// connection is reported dead instead of sending another probe.
    pub fn on_tick(&mut self, now: Instant, client_timestamp_ms: i64) -> HeartbeatTick {
        self.expire(now);
        self.next_tick = Some(now + self.config.interval());

        if self.is_dead() {
            return HeartbeatTick::Dead {
                missed: self.record.missed_count,
            };
        }

        self.record.last_sent_at = Some(now);
        self.ack_deadlines.push_back(now + self.config.ack_timeout());
        HeartbeatTick::Ping {
            payload: heartbeat_payload(client_timestamp_ms, self.record.missed_count),
        }
    }

    /// Count every probe whose deadline has passed as missed.
    ///
    /// Returns `true` when the miss limit has been reached.
    pub fn expire(&mut self, now: Instant) -> bool {
        while self.ack_deadlines.front().is_some_and(|deadline| *deadline <= now) {
            self.ack_deadlines.pop_front();
            self.record.missed_count += 1;
        }
        self.is_dead()
    }

    /// Record an acknowledgement. Returns the measured round trip, if a probe
    /// was sent on this connection.
    pub fn on_ack(&mut self, now: Instant, server_timestamp: Option<i64>) -> Option<Duration> {
        self.record.missed_count = 0;
        self.record.last_ack_at = Some(now);
        self.ack_deadlines.clear();
        if server_timestamp.is_some() {
            self.last_server_timestamp = server_timestamp;
        }

        let rtt = self.record.last_sent_at.map(|sent| now.duration_since(sent));
        if rtt.is_some() {
            self.last_rtt = rtt;
        }
        rtt
    }
}
