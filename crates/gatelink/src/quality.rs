//! Connection quality estimation.
//!
//! A 0–100 score derived from heartbeat misses, acknowledgement staleness and
//! connection age. It is recomputed on a fixed interval and on every PONG, and a
//! critical score while connected triggers a proactive reconnect.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for quality scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QualityConfig {
    /// Interval between periodic evaluations, in milliseconds.
    pub check_interval_ms: u64,
    /// Points lost per missed heartbeat.
    pub missed_heartbeat_penalty: u32,
    /// Acknowledgement age that starts costing points, in seconds.
    pub stale_ack_warn_secs: u64,
    /// Points lost once the warning age is exceeded.
    pub stale_ack_warn_penalty: u32,
    /// Acknowledgement age treated as severe, in seconds.
    pub stale_ack_critical_secs: u64,
    /// Points lost once the severe age is exceeded (replaces the warning penalty).
    pub stale_ack_critical_penalty: u32,
    /// Connection age that earns the stability bonus, in seconds.
    pub stable_after_secs: u64,
    /// Bonus points for a long-lived connection.
    pub stable_bonus: u32,
    /// Reconnect when the score becomes critical while connected.
    pub proactive_reconnect: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            missed_heartbeat_penalty: 20,
            stale_ack_warn_secs: 30,
            stale_ack_warn_penalty: 20,
            stale_ack_critical_secs: 60,
            stale_ack_critical_penalty: 40,
            stable_after_secs: 300,
            stable_bonus: 10,
            proactive_reconnect: true,
        }
    }
}

impl QualityConfig {
    /// Interval between periodic evaluations.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Quality classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// Score of 90 or more.
    Excellent,
    /// Score of 70 to 89.
    Good,
    /// Score of 40 to 69.
    Poor,
    /// Score below 40.
    Critical,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Derived score in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QualityScore(u8);

impl QualityScore {
    /// Perfect score.
    pub const MAX: Self = Self(100);

    /// Create a score, clamping into `0..=100`.
    #[must_use]
    pub fn new(points: i64) -> Self {
        Self(points.clamp(0, 100) as u8)
    }

    /// Numeric value.
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Classification of this score.
    #[must_use]
    pub const fn level(self) -> QualityLevel {
        match self.0 {
            90.. => QualityLevel::Excellent,
            70..=89 => QualityLevel::Good,
            40..=69 => QualityLevel::Poor,
            _ => QualityLevel::Critical,
        }
    }
}

impl Default for QualityScore {
    fn default() -> Self {
        Self::MAX
    }
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.level())
    }
}

/// Observations a score is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityInputs {
    /// Consecutive missed heartbeats.
    pub missed_heartbeats: u32,
    /// Time since the last PONG, or since the connection opened if none yet.
    pub since_last_ack: Duration,
    /// Time since the connection opened.
    pub connected_for: Duration,
}

/// Compute a score from observations.
#[must_use]
pub fn compute_score(config: &QualityConfig, inputs: &QualityInputs) -> QualityScore {
    let mut points: i64 = 100;

    points -= i64::from(inputs.missed_heartbeats) * i64::from(config.missed_heartbeat_penalty);

    let ack_age = inputs.since_last_ack.as_secs();
    if ack_age > config.stale_ack_critical_secs {
        points -= i64::from(config.stale_ack_critical_penalty);
    } else if ack_age > config.stale_ack_warn_secs {
        points -= i64::from(config.stale_ack_warn_penalty);
    }

    if inputs.connected_for.as_secs() >= config.stable_after_secs {
        points += i64::from(config.stable_bonus);
    }

    QualityScore::new(points)
}

/// Holds the latest score and the periodic evaluation schedule.
#[derive(Debug)]
pub struct QualityEstimator {
    config: QualityConfig,
    score: QualityScore,
    next_check: Option<Instant>,
}

impl QualityEstimator {
    /// Create an idle estimator with a perfect score.
    #[must_use]
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            score: QualityScore::MAX,
            next_check: None,
        }
    }

    /// Begin periodic evaluation for a new connection.
    pub fn start(&mut self, now: Instant) {
        self.score = QualityScore::MAX;
        self.next_check = Some(now + self.config.check_interval());
    }

    /// Stop periodic evaluation.
    pub fn stop(&mut self) {
        self.next_check = None;
    }

    /// When the next periodic evaluation is due.
    #[must_use]
    pub const fn next_check(&self) -> Option<Instant> {
        self.next_check
    }

    /// Latest score.
    #[must_use]
    pub const fn score(&self) -> QualityScore {
        self.score
    }

    /// Recompute and store the score. Periodic callers pass `Some(now)` to
    /// schedule the next evaluation.
    pub fn evaluate(&mut self, inputs: &QualityInputs, reschedule_from: Option<Instant>) -> QualityScore {
        if let Some(now) = reschedule_from {
            self.next_check = Some(now + self.config.check_interval());
        }
        self.score = compute_score(&self.config, inputs);
        self.score
    }

    /// Whether `score` warrants a proactive reconnect.
    #[must_use]
    pub fn should_reconnect(&self, score: QualityScore) -> bool {
        self.config.proactive_reconnect && score.level() == QualityLevel::Critical
    }
}
