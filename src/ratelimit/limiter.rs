//! The limiter engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::counter::CounterEntry;
use super::decision::{Decision, Evaluation, ReleaseToken};
use super::policy::TierPolicy;
use super::tiers::Tier;

/// Admit/reject engine for one tier.
///
/// Counters are keyed by client key and stored in a sharded map. The
/// read-check-increment sequence for a key runs under that key's shard
/// lock, so concurrent evaluations of the same key are serialized and can
/// never both take the last slot.
pub struct Limiter {
    /// Tier this limiter enforces
    tier: Tier,
    /// Window, quota and exemption rule
    policy: TierPolicy,
    /// Counter entries indexed by client key
    entries: DashMap<String, CounterEntry>,
    /// Time source
    clock: Arc<dyn Clock>,
}

/// Point-in-time statistics for a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub tier: Tier,
    pub active_entries: usize,
    pub quota: u32,
    pub window_secs: u64,
}

impl Limiter {
    /// Create a limiter with an empty counter store.
    pub fn new(tier: Tier, policy: TierPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            tier,
            policy,
            entries: DashMap::new(),
            clock,
        }
    }

    /// Get the tier this limiter enforces.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Get the policy this limiter enforces.
    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Evaluate one request from `key` at the current clock time.
    pub fn evaluate(&self, key: &str) -> Evaluation {
        self.evaluate_at(key, self.clock.now())
    }

    /// Evaluate one request from `key` at `now`.
    ///
    /// An admitted request consumes one slot. A rejected request consumes
    /// nothing and reports `remaining = 0` with the unchanged reset time.
    pub fn evaluate_at(&self, key: &str, now: DateTime<Utc>) -> Evaluation {
        let window = self.policy.window();
        let quota = self.policy.quota();

        let (admitted, remaining, window_start, ticket) = {
            let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
                debug!(tier = %self.tier, key = %key, "Creating new counter entry");
                CounterEntry::new(now)
            });

            if entry.roll(now, window) {
                debug!(tier = %self.tier, key = %key, "Counter window reset");
            }

            let admitted = entry.try_admit(now, window, quota);
            let remaining = if admitted { entry.remaining(quota) } else { 0 };
            let ticket = (admitted && self.policy.count_only_failures())
                .then(|| entry.issue_ticket());
            (admitted, remaining, entry.window_start(), ticket)
        };

        trace!(
            tier = %self.tier,
            key = %key,
            admitted = admitted,
            remaining = remaining,
            "Evaluated request"
        );

        let decision = Decision {
            tier: self.tier,
            admitted,
            limit: quota,
            remaining,
            reset_at: window_start + window,
            window_secs: window.num_seconds().max(0) as u64,
            header_mode: self.policy.header_mode(),
        };

        let release = ticket.map(|ticket| ReleaseToken {
            tier: self.tier,
            key: key.to_owned(),
            window_start,
            ticket,
        });

        Evaluation {
            decision,
            window_start,
            release,
        }
    }

    /// Undo the slot consumed by an admitted request that succeeded.
    ///
    /// Only meaningful for tiers that count failures only. Each token gives
    /// back at most one slot. Returns `true` if a slot was given back.
    pub fn release(&self, token: ReleaseToken) -> bool {
        if token.tier != self.tier {
            warn!(
                tier = %self.tier,
                token_tier = %token.tier,
                "Ignoring release token issued by another tier"
            );
            return false;
        }
        if !self.policy.count_only_failures() {
            warn!(tier = %self.tier, "Ignoring release on a tier that counts every request");
            return false;
        }

        let released = self
            .entries
            .get_mut(&token.key)
            .map(|mut entry| entry.release(token.window_start, token.ticket))
            .unwrap_or(false);

        debug!(
            tier = %self.tier,
            key = %token.key,
            released = released,
            "Processed release"
        );
        released
    }

    /// Undo the slot taken by an admission in the window that began at
    /// `window_start`, after a later tier rejected the same request.
    pub(crate) fn refund(&self, key: &str, window_start: DateTime<Utc>) -> bool {
        let refunded = self
            .entries
            .get_mut(key)
            .map(|mut entry| entry.refund(window_start))
            .unwrap_or(false);

        trace!(tier = %self.tier, key = %key, refunded = refunded, "Processed refund");
        refunded
    }

    /// Remove entries idle for at least one full window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(self.clock.now())
    }

    /// Remove entries idle at `now`. Returns the number removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let window = self.policy.window();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_idle(now, window));
        before.saturating_sub(self.entries.len())
    }

    /// Get the current count for a key.
    ///
    /// Returns `None` if no entry exists for the key.
    pub fn counter_value(&self, key: &str) -> Option<u32> {
        self.entries.get(key).map(|entry| entry.count())
    }

    /// Get the number of active entries.
    pub fn counter_count(&self) -> usize {
        self.entries.len()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Get current statistics.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            tier: self.tier,
            active_entries: self.entries.len(),
            quota: self.policy.quota(),
            window_secs: self.policy.window().num_seconds().max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use chrono::TimeDelta;
    use std::sync::Barrier;
    use std::time::Duration;

    const KEY: &str = "198.51.100.7";

    fn limiter(quota: u32, count_only_failures: bool) -> (Limiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let policy = TierPolicy::new(Duration::from_secs(15 * 60), quota)
            .unwrap()
            .with_count_only_failures(count_only_failures);
        let tier = if count_only_failures {
            Tier::Authentication
        } else {
            Tier::General
        };
        (Limiter::new(tier, policy, clock.clone()), clock)
    }

    #[test]
    fn test_limiter_creation() {
        let (limiter, _) = limiter(5, false);
        assert_eq!(limiter.counter_count(), 0);
    }

    #[test]
    fn test_quota_ceiling() {
        let (limiter, clock) = limiter(5, false);

        for i in 0..5 {
            let decision = limiter.evaluate(KEY).decision;
            assert!(decision.admitted, "Request {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 4 - i);
            assert_eq!(decision.reset_at, clock.now() + TimeDelta::minutes(15));
        }

        let decision = limiter.evaluate(KEY).decision;
        assert!(!decision.admitted);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, clock.now() + TimeDelta::minutes(15));
    }

    #[test]
    fn test_window_reset_starts_fresh_count() {
        let (limiter, clock) = limiter(5, false);
        for _ in 0..6 {
            limiter.evaluate(KEY);
        }

        clock.advance(TimeDelta::minutes(15) + TimeDelta::seconds(1));
        let decision = limiter.evaluate(KEY).decision;

        assert!(decision.admitted);
        assert_eq!(limiter.counter_value(KEY), Some(1));
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_at, clock.now() + TimeDelta::minutes(15));
    }

    #[test]
    fn test_rejections_do_not_consume_quota() {
        let (limiter, clock) = limiter(3, false);
        for _ in 0..50 {
            limiter.evaluate(KEY);
        }
        assert_eq!(limiter.counter_value(KEY), Some(3));

        clock.advance(TimeDelta::minutes(15));
        let admitted = (0..10)
            .filter(|_| limiter.evaluate(KEY).decision.admitted)
            .count();

        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_different_keys_have_separate_counters() {
        let (limiter, _) = limiter(2, false);

        limiter.evaluate("192.0.2.1");
        limiter.evaluate("192.0.2.1");
        let other = limiter.evaluate("192.0.2.2").decision;

        assert!(other.admitted);
        assert_eq!(other.remaining, 1);
        assert!(!limiter.evaluate("192.0.2.1").decision.admitted);
    }

    #[test]
    fn test_release_token_only_for_exemption_tiers() {
        let (general, _) = limiter(5, false);
        assert!(general.evaluate(KEY).release.is_none());

        let (auth, _) = limiter(5, true);
        let evaluation = auth.evaluate(KEY);
        let token = evaluation.release.unwrap();
        assert_eq!(token.key, KEY);
        assert_eq!(token.tier, Tier::Authentication);
    }

    #[test]
    fn test_rejected_request_has_no_release_token() {
        let (auth, _) = limiter(1, true);
        auth.evaluate(KEY);
        assert!(auth.evaluate(KEY).release.is_none());
    }

    #[test]
    fn test_release_gives_back_slot() {
        let (auth, _) = limiter(5, true);

        let token = auth.evaluate(KEY).release.unwrap();
        assert_eq!(auth.counter_value(KEY), Some(1));

        assert!(auth.release(token));
        assert_eq!(auth.counter_value(KEY), Some(0));
    }

    #[test]
    fn test_replayed_token_releases_once() {
        let (auth, _) = limiter(5, true);

        let tokens: Vec<ReleaseToken> = (0..5)
            .map(|_| auth.evaluate(KEY).release.unwrap())
            .collect();
        assert_eq!(auth.counter_value(KEY), Some(5));

        let replay = |token: &ReleaseToken| ReleaseToken {
            tier: token.tier,
            key: token.key.clone(),
            window_start: token.window_start,
            ticket: token.ticket,
        };
        assert!(auth.release(replay(&tokens[0])));
        for _ in 0..4 {
            assert!(!auth.release(replay(&tokens[0])));
        }
        assert_eq!(auth.counter_value(KEY), Some(4));
    }

    #[test]
    fn test_release_after_window_rollover_is_noop() {
        let (auth, clock) = limiter(5, true);
        let token = auth.evaluate(KEY).release.unwrap();

        clock.advance(TimeDelta::minutes(16));
        auth.evaluate(KEY);

        assert!(!auth.release(token));
        assert_eq!(auth.counter_value(KEY), Some(1));
    }

    #[test]
    fn test_release_rejects_foreign_tier_token() {
        let (auth, _) = limiter(5, true);
        auth.evaluate(KEY);

        let foreign = ReleaseToken {
            tier: Tier::PasswordReset,
            key: KEY.to_string(),
            window_start: DateTime::<Utc>::UNIX_EPOCH,
            ticket: 0,
        };
        assert!(!auth.release(foreign));
        assert_eq!(auth.counter_value(KEY), Some(1));
    }

    #[test]
    fn test_release_on_counting_tier_is_ignored() {
        let (general, clock) = limiter(5, false);
        general.evaluate(KEY);

        let token = ReleaseToken {
            tier: Tier::General,
            key: KEY.to_string(),
            window_start: clock.now(),
            ticket: 0,
        };
        assert!(!general.release(token));
        assert_eq!(general.counter_value(KEY), Some(1));
    }

    #[test]
    fn test_refund_gives_back_slot_in_same_window() {
        let (general, clock) = limiter(5, false);
        let evaluation = general.evaluate(KEY);
        assert_eq!(evaluation.window_start, clock.now());

        assert!(general.refund(KEY, evaluation.window_start));
        assert_eq!(general.counter_value(KEY), Some(0));
        assert!(!general.refund(KEY, evaluation.window_start));
        assert!(!general.refund("192.0.2.250", evaluation.window_start));
    }

    #[test]
    fn test_sweep_reclaims_idle_entries() {
        let (limiter, clock) = limiter(5, false);
        limiter.evaluate("192.0.2.1");
        clock.advance(TimeDelta::minutes(10));
        limiter.evaluate("192.0.2.2");

        clock.advance(TimeDelta::minutes(5));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.counter_value("192.0.2.1"), None);
        assert_eq!(limiter.counter_value("192.0.2.2"), Some(1));

        clock.advance(TimeDelta::minutes(10));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.counter_count(), 0);
    }

    #[test]
    fn test_throttled_key_survives_sweep() {
        let (limiter, clock) = limiter(1, false);
        limiter.evaluate(KEY);

        clock.advance(TimeDelta::minutes(14));
        assert!(!limiter.evaluate(KEY).decision.admitted);

        clock.advance(TimeDelta::minutes(14));
        assert_eq!(limiter.sweep(), 0);
    }

    #[test]
    fn test_concurrent_requests_admit_exactly_quota() {
        let (limiter, _) = limiter(10, false);
        let threads = 64;
        let barrier = Barrier::new(threads);

        let limiter = &limiter;
        let barrier = &barrier;

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        limiter.evaluate(KEY).decision.admitted
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|admitted| *admitted)
                .count()
        });

        assert_eq!(admitted, 10);
        assert_eq!(limiter.counter_value(KEY), Some(10));
    }

    #[test]
    fn test_clear_and_stats() {
        let (limiter, _) = limiter(5, false);
        limiter.evaluate(KEY);

        let stats = limiter.stats();
        assert_eq!(stats.tier, Tier::General);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.quota, 5);
        assert_eq!(stats.window_secs, 900);

        limiter.clear();
        assert_eq!(limiter.counter_count(), 0);
    }
}
