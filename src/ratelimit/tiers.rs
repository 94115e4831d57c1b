//! The three preconfigured throttling tiers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::clock::Clock;
use super::decision::{Decision, Rejection, ReleaseToken};
use super::limiter::{Limiter, LimiterStats};
use super::policy::OperatingMode;
use crate::config::ThrottleConfig;
use crate::error::Result;

/// A named throttling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// All API traffic
    General,
    /// Login and other credential checks
    Authentication,
    /// Account recovery
    PasswordReset,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::General, Tier::Authentication, Tier::PasswordReset];

    /// Get the tier name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::General => "general",
            Tier::Authentication => "authentication",
            Tier::PasswordReset => "password_reset",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking a request against one or more tiers.
#[derive(Debug)]
pub struct TierOutcome {
    /// Decision whose metadata is reported to the client: the rejecting
    /// tier's on rejection, otherwise the last tier evaluated
    pub decision: Decision,
    /// Release tokens for every exemption tier that admitted the request
    pub release_tokens: Vec<ReleaseToken>,
    /// Set when any tier rejected the request
    pub rejection: Option<Rejection>,
}

impl TierOutcome {
    pub fn admitted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Owns one [`Limiter`] per tier. Tiers never share counters.
pub struct TierRegistry {
    mode: OperatingMode,
    general: Limiter,
    authentication: Limiter,
    password_reset: Limiter,
    clock: Arc<dyn Clock>,
}

impl TierRegistry {
    /// Build all tiers from configuration.
    ///
    /// Fails on any invalid tier policy; callers should treat this as fatal.
    pub fn new(config: &ThrottleConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let registry = Self {
            mode: config.mode,
            general: Limiter::new(Tier::General, config.policy(Tier::General)?, clock.clone()),
            authentication: Limiter::new(
                Tier::Authentication,
                config.policy(Tier::Authentication)?,
                clock.clone(),
            ),
            password_reset: Limiter::new(
                Tier::PasswordReset,
                config.policy(Tier::PasswordReset)?,
                clock.clone(),
            ),
            clock,
        };

        for tier in Tier::ALL {
            let policy = registry.limiter(tier).policy();
            info!(
                tier = %tier,
                mode = %registry.mode,
                quota = policy.quota(),
                window_secs = policy.window().num_seconds(),
                count_only_failures = policy.count_only_failures(),
                "Tier configured"
            );
        }

        Ok(registry)
    }

    /// Get the operating mode the quotas were chosen for.
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Current time according to the registry's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn limiter(&self, tier: Tier) -> &Limiter {
        match tier {
            Tier::General => &self.general,
            Tier::Authentication => &self.authentication,
            Tier::PasswordReset => &self.password_reset,
        }
    }

    /// Evaluate a request against `tiers` in order.
    ///
    /// The request is admitted only if every tier admits it. Evaluation
    /// stops at the first rejection, so later tiers are not charged, and the
    /// slots taken by earlier tiers are given back. Returns `None` if `tiers`
    /// is empty.
    pub fn evaluate(&self, tiers: &[Tier], key: &str) -> Option<TierOutcome> {
        let now = self.clock.now();
        let mut release_tokens = Vec::new();
        let mut charged = Vec::new();
        let mut last = None;

        for &tier in tiers {
            let limiter = self.limiter(tier);
            let evaluation = limiter.evaluate_at(key, now);

            if !evaluation.decision.admitted {
                warn!(
                    tier = %tier,
                    key = %key,
                    reset_at = %evaluation.decision.reset_at,
                    "Rate limit exceeded"
                );
                self.roll_back(key, charged, release_tokens);
                return Some(TierOutcome {
                    decision: evaluation.decision,
                    release_tokens: Vec::new(),
                    rejection: Some(Rejection::new(limiter.policy().message())),
                });
            }

            match evaluation.release {
                Some(token) => release_tokens.push(token),
                None => charged.push((tier, evaluation.window_start)),
            }
            last = Some(evaluation.decision);
        }

        last.map(|decision| TierOutcome {
            decision,
            release_tokens,
            rejection: None,
        })
    }

    /// Undo the admissions of a request that a later tier rejected.
    fn roll_back(
        &self,
        key: &str,
        charged: Vec<(Tier, DateTime<Utc>)>,
        release_tokens: Vec<ReleaseToken>,
    ) {
        for (tier, window_start) in charged {
            self.limiter(tier).refund(key, window_start);
        }
        for token in release_tokens {
            self.release(token);
        }
    }

    /// Report that an admitted request succeeded.
    pub fn release(&self, token: ReleaseToken) -> bool {
        self.limiter(token.tier).release(token)
    }

    /// Reclaim idle entries in every tier. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        Tier::ALL
            .iter()
            .map(|&tier| self.limiter(tier).sweep_at(now))
            .sum()
    }

    pub fn stats(&self) -> Vec<LimiterStats> {
        Tier::ALL
            .iter()
            .map(|&tier| self.limiter(tier).stats())
            .collect()
    }
}
