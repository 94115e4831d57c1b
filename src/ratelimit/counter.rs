//! Fixed-window counter for a single client key.

use chrono::{DateTime, TimeDelta, Utc};

/// Request count for one key within the current window.
///
/// Entries are not synchronized; the owning [`Limiter`](super::Limiter)
/// holds the shard lock for the key while calling into them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    /// When the current window started
    window_start: DateTime<Utc>,
    /// Requests counted in the current window
    count: u32,
    /// Last time any request was evaluated against this entry
    last_seen: DateTime<Utc>,
    /// Next release ticket to hand out
    next_ticket: u64,
    /// Tickets issued in the current window that have not been released
    outstanding: Vec<u64>,
}

impl CounterEntry {
    /// Create an empty entry whose window opens at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count: 0,
            last_seen: now,
            next_ticket: 0,
            outstanding: Vec::new(),
        }
    }

    /// Start a fresh window if the current one has expired.
    ///
    /// Returns `true` if the window was reset.
    pub fn roll(&mut self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        if now - self.window_start >= window {
            self.window_start = now;
            self.count = 0;
            self.outstanding.clear();
            true
        } else {
            false
        }
    }

    /// Count one request if there is room under `quota`.
    ///
    /// Rejected requests are not counted.
    pub fn try_admit(&mut self, now: DateTime<Utc>, window: TimeDelta, quota: u32) -> bool {
        self.roll(now, window);
        if now > self.last_seen {
            self.last_seen = now;
        }

        if self.count < quota {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Issue a release ticket for the request just admitted.
    ///
    /// Outstanding tickets never exceed the count, so the set is bounded by
    /// the quota.
    pub fn issue_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.outstanding.push(ticket);
        ticket
    }

    /// Give back the slot that `ticket` was issued for in the window that
    /// began at `window_start`.
    ///
    /// Does nothing if that window has already been replaced or the ticket
    /// was already released. Returns `true` if the count was decremented.
    pub fn release(&mut self, window_start: DateTime<Utc>, ticket: u64) -> bool {
        if self.window_start != window_start {
            return false;
        }
        let Some(pos) = self.outstanding.iter().position(|t| *t == ticket) else {
            return false;
        };
        self.outstanding.swap_remove(pos);
        self.count = self.count.saturating_sub(1);
        true
    }

    /// Give back one untracked slot counted in the window that began at
    /// `window_start`.
    ///
    /// Used when a request admitted here was rejected by a later tier.
    pub fn refund(&mut self, window_start: DateTime<Utc>) -> bool {
        if self.window_start != window_start || self.count == 0 {
            return false;
        }
        self.count -= 1;
        true
    }

    /// Get the current count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Get the start of the current window.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }

    /// Get the remaining quota.
    pub fn remaining(&self, quota: u32) -> u32 {
        quota.saturating_sub(self.count)
    }

    /// Get the time the current window ends.
    pub fn reset_at(&self, window: TimeDelta) -> DateTime<Utc> {
        self.window_start + window
    }

    /// Whether the entry has seen no traffic for at least one full window.
    pub fn is_idle(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        now - self.last_seen >= window
    }
}
