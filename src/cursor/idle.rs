// ABOUTME: Idle gate for cursor units that recently returned no rows
// ABOUTME: Linear backoff per consecutive empty poll, capped at a maximum delay

use std::time::{Duration, Instant};

/// Backoff parameters: each consecutive empty poll adds `interval`, up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub interval: Duration,
    pub max: Duration,
}

impl IdlePolicy {
    pub fn new(interval: Duration, max: Duration) -> Self {
        Self { interval, max }
    }

    /// Delay after `count` consecutive empty polls.
    pub fn delay(&self, count: u32) -> Duration {
        self.interval.saturating_mul(count).min(self.max)
    }
}

/// Idle bookkeeping of one cursor unit. Absent while the unit is active.
///
/// `since` is the time of the first empty poll of the streak and never moves
/// while the unit stays idle. The next poll is due at
/// `since + min(interval × count, max)`, so once the cap is reached and that
/// instant has passed, every poll is permitted until a row shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleState {
    since: Instant,
    count: u32,
}

impl IdleState {
    /// Enter the idle state after the first empty poll.
    pub fn begin(now: Instant) -> Self {
        Self {
            since: now,
            count: 1,
        }
    }

    /// Record another empty poll, returning the updated state.
    pub fn record_empty(self) -> Self {
        Self {
            since: self.since,
            count: self.count.saturating_add(1),
        }
    }


    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn delay(&self, policy: &IdlePolicy) -> Duration {
        policy.delay(self.count)
    }

    /// Whether a poll may run at `now`.
    pub fn permits(&self, now: Instant, policy: &IdlePolicy) -> bool {
        now.saturating_duration_since(self.since) >= self.delay(policy)
    }
}

/// Next idle state after a poll that returned `rows` rows.
pub fn after_poll(previous: Option<IdleState>, rows: usize, now: Instant) -> Option<IdleState> {
    if rows > 0 {
        None
    } else {
        Some(match previous {
            Some(state) => state.record_empty(),
            None => IdleState::begin(now),
        })
    }
}
