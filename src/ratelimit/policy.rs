//! Tier policies and operating mode.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::headers::HeaderMode;
use crate::error::{Result, TurnstileError};

/// Environment variable consulted when no operating mode is configured.
pub const MODE_ENV_VAR: &str = "APP_ENV";

/// Process-wide quota regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Production quotas
    Restrictive,
    /// Development quotas
    Relaxed,
}

impl OperatingMode {
    /// Map a deployment environment name to a mode.
    ///
    /// Only `production` is restrictive.
    pub fn from_environment_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("production") {
            OperatingMode::Restrictive
        } else {
            OperatingMode::Relaxed
        }
    }

    /// Resolve the mode from [`MODE_ENV_VAR`].
    pub fn from_env() -> Self {
        std::env::var(MODE_ENV_VAR)
            .map(|name| Self::from_environment_name(&name))
            .unwrap_or(OperatingMode::Relaxed)
    }

    /// Get the mode name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Restrictive => "restrictive",
            OperatingMode::Relaxed => "relaxed",
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable configuration for a single tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    window: TimeDelta,
    quota: u32,
    count_only_failures: bool,
    message: String,
    header_mode: HeaderMode,
}

impl TierPolicy {
    /// Create a policy admitting `quota` requests per `window`.
    ///
    /// Fails if either value is zero or the window is too large to represent.
    pub fn new(window: Duration, quota: u32) -> Result<Self> {
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        if quota == 0 {
            return Err(TurnstileError::Config(
                "quota must be greater than zero".to_string(),
            ));
        }
        let window = TimeDelta::from_std(window).map_err(|e| {
            TurnstileError::Config(format!("window duration out of range: {}", e))
        })?;

        Ok(Self {
            window,
            quota,
            count_only_failures: false,
            message: "Too many requests, please try again later.".to_string(),
            header_mode: HeaderMode::default(),
        })
    }

    /// Exempt successful requests from the quota.
    pub fn with_count_only_failures(mut self, enabled: bool) -> Self {
        self.count_only_failures = enabled;
        self
    }

    /// Set the message returned on rejection.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Select the rate-limit header convention.
    pub fn with_header_mode(mut self, header_mode: HeaderMode) -> Self {
        self.header_mode = header_mode;
        self
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub fn count_only_failures(&self) -> bool {
        self.count_only_failures
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn header_mode(&self) -> HeaderMode {
        self.header_mode
    }
}
