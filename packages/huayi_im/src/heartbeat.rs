//! Heartbeat bookkeeping and reconnect backoff for the push connection.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often we send our own ping.
    pub ping_interval: Duration,
    /// How often the watchdog checks staleness and probes the session.
    pub watchdog_interval: Duration,
    /// Silence longer than this means the connection is half-open.
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(65),
        }
    }
}

/// Outstanding pings and the time of the last acknowledgment.
///
/// Ping ids increase monotonically for the lifetime of the tracker; they are
/// not reset between connections.
#[derive(Debug)]
pub struct Heartbeat {
    next_id: i64,
    pending: HashSet<i64>,
    last_ack_at: Instant,
}

impl Heartbeat {
    pub fn new(now: Instant) -> Self {
        Self {
            next_id: 0,
            pending: HashSet::new(),
            last_ack_at: now,
        }
    }

    /// Fresh connection: forget outstanding pings, count `now` as acked.
    pub fn reset(&mut self, now: Instant) {
        self.pending.clear();
        self.last_ack_at = now;
    }

    /// Allocate the id for the next ping and mark it outstanding.
    pub fn next_ping(&mut self) -> i64 {
        self.next_id += 1;
        self.pending.insert(self.next_id);
        self.next_id
    }

    /// Confirm one of our own pings. Returns false for ids we never sent
    /// (or already confirmed).
    pub fn confirm(&mut self, id: i64, now: Instant) -> bool {
        if self.pending.remove(&id) {
            self.last_ack_at = now;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, id: i64) -> bool {
        self.pending.contains(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_ack_at) > stale_after
    }
}

/// Linear, capped reconnect delay: `min(max, base + attempt * step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            step: Duration::from_millis(800),
            max: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_add(self.step.saturating_mul(attempt))
            .min(self.max)
    }
}

/// Attempt counter driving [`BackoffPolicy`]. Reset only on a successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Count one more attempt and return its delay.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
