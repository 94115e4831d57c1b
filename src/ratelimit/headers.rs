//! Rate limit response header rendering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::decision::Decision;

pub const RATELIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATELIMIT_RESET: &str = "ratelimit-reset";
pub const RATELIMIT_POLICY: &str = "ratelimit-policy";

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

pub const RETRY_AFTER: &str = "retry-after";

/// Which header convention a tier emits. Exactly one is active per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    /// `RateLimit-*` headers; reset is relative seconds.
    #[default]
    Standard,
    /// `X-RateLimit-*` headers; reset is a Unix timestamp.
    Legacy,
}

/// Render the headers for a decision as lowercase name/value pairs.
pub fn render(decision: &Decision, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
    let mut headers = Vec::with_capacity(5);
    let reset_in = seconds_until(decision.reset_at, now);

    match decision.header_mode {
        HeaderMode::Standard => {
            headers.push((RATELIMIT_LIMIT, decision.limit.to_string()));
            headers.push((RATELIMIT_REMAINING, decision.remaining.to_string()));
            headers.push((RATELIMIT_RESET, reset_in.to_string()));
            headers.push((
                RATELIMIT_POLICY,
                format!("{};w={}", decision.limit, decision.window_secs),
            ));
        }
        HeaderMode::Legacy => {
            headers.push((X_RATELIMIT_LIMIT, decision.limit.to_string()));
            headers.push((X_RATELIMIT_REMAINING, decision.remaining.to_string()));
            headers.push((X_RATELIMIT_RESET, epoch_seconds_ceil(decision.reset_at).to_string()));
        }
    }

    if !decision.admitted {
        headers.push((RETRY_AFTER, reset_in.max(1).to_string()));
    }

    headers
}

/// Whole seconds from `now` until `at`, rounded up, never negative.
fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (at - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis as u64).div_ceil(1000)
    }
}

fn epoch_seconds_ceil(at: DateTime<Utc>) -> i64 {
    if at.timestamp_subsec_nanos() > 0 {
        at.timestamp() + 1
    } else {
        at.timestamp()
    }
}
