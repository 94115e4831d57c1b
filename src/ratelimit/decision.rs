//! Admission decisions and the values derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::headers::HeaderMode;
use super::tiers::Tier;

/// The outcome of evaluating one request against one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Tier that produced this decision
    pub tier: Tier,
    /// Whether the request may proceed
    pub admitted: bool,
    /// Quota ceiling for the window
    pub limit: u32,
    /// Requests left in the current window; always 0 on rejection
    pub remaining: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Length of the window in seconds
    pub window_secs: u64,
    /// Header convention for this tier
    pub header_mode: HeaderMode,
}

/// Proof that a request was admitted by an exemption tier.
///
/// Handing it back to [`Limiter::release`](super::Limiter::release) undoes
/// the slot that request consumed. The ticket is retired on first use, so
/// an admission can be released at most once even if the token is replayed
/// from its serialized form.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseToken {
    pub tier: Tier,
    pub key: String,
    pub window_start: DateTime<Utc>,
    pub ticket: u64,
}

/// A decision plus, for exemption tiers, the token to release it with.
#[derive(Debug)]
pub struct Evaluation {
    pub decision: Decision,
    /// Start of the window the request was counted in
    pub window_start: DateTime<Utc>,
    pub release: Option<ReleaseToken>,
}

/// Payload returned to clients that were throttled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub success: bool,
    pub message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
