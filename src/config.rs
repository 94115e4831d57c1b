//! Configuration management for Turnstile.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{ForwardedSource, HeaderMode, OperatingMode, Tier, TierPolicy};

/// Prefix for environment variable overrides, e.g.
/// `TURNSTILE__THROTTLE__MODE=restrictive`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Throttling configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address for the decision API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// How often idle counter entries are reclaimed, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_sweep_interval() -> u64 {
    60
}

/// Throttling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Quota regime; resolved from `APP_ENV` when not set
    #[serde(default = "OperatingMode::from_env")]
    pub mode: OperatingMode,

    /// Header convention for tiers that do not choose their own
    #[serde(default)]
    pub header_mode: HeaderMode,

    /// Trusted forwarded-address source
    #[serde(default)]
    pub forwarded: ForwardedSource,

    /// Aggregate IPv6 clients by this prefix length
    #[serde(default)]
    pub ipv6_prefix: Option<u8>,

    /// Per-tier settings
    #[serde(default)]
    pub tiers: TierTable,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::from_env(),
            header_mode: HeaderMode::default(),
            forwarded: ForwardedSource::default(),
            ipv6_prefix: None,
            tiers: TierTable::default(),
        }
    }
}

impl ThrottleConfig {
    /// Build the validated policy for a tier under the configured mode.
    pub fn policy(&self, tier: Tier) -> Result<TierPolicy> {
        let settings = self.tiers.get(tier);
        let policy = TierPolicy::new(
            Duration::from_secs(settings.window_secs),
            settings.quota(self.mode),
        )
        .map_err(|e| TurnstileError::Config(format!("tier {}: {}", tier, e)))?;

        Ok(policy
            .with_count_only_failures(settings.count_only_failures)
            .with_message(settings.message.clone())
            .with_header_mode(settings.header_mode.unwrap_or(self.header_mode)))
    }

    /// Check everything that can be checked before the registry is built.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            self.policy(tier)?;
        }
        if let Some(prefix) = self.ipv6_prefix {
            if prefix == 0 || prefix > 128 {
                return Err(TurnstileError::Config(format!(
                    "ipv6_prefix must be between 1 and 128, got {}",
                    prefix
                )));
            }
        }
        if let ForwardedSource::XForwardedFor { hops: 0 } = self.forwarded {
            return Err(TurnstileError::Config(
                "x_forwarded_for hops must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for all three tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "TierSettings::general")]
    pub general: TierSettings,

    #[serde(default = "TierSettings::authentication")]
    pub authentication: TierSettings,

    #[serde(default = "TierSettings::password_reset")]
    pub password_reset: TierSettings,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            general: TierSettings::general(),
            authentication: TierSettings::authentication(),
            password_reset: TierSettings::password_reset(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::General => &self.general,
            Tier::Authentication => &self.authentication,
            Tier::PasswordReset => &self.password_reset,
        }
    }
}

/// Window, quotas and exemption rule for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSettings {
    /// Window length in seconds
    pub window_secs: u64,
    /// Quota in restrictive mode
    pub restrictive_quota: u32,
    /// Quota in relaxed mode
    pub relaxed_quota: u32,
    /// Do not count requests that succeed
    #[serde(default)]
    pub count_only_failures: bool,
    /// Message returned on rejection
    pub message: String,
    /// Overrides the global header mode
    #[serde(default)]
    pub header_mode: Option<HeaderMode>,
}

impl TierSettings {
    /// Blanket protection for all API traffic.
    pub fn general() -> Self {
        Self {
            window_secs: 15 * 60,
            restrictive_quota: 100,
            relaxed_quota: 1000,
            count_only_failures: false,
            message: "Too many requests from this IP, please try again later.".to_string(),
            header_mode: None,
        }
    }

    /// Credential endpoints; successful logins are not counted.
    pub fn authentication() -> Self {
        Self {
            window_secs: 15 * 60,
            restrictive_quota: 5,
            relaxed_quota: 100,
            count_only_failures: true,
            message: "Too many authentication attempts, please try again later.".to_string(),
            header_mode: None,
        }
    }

    /// Account recovery endpoints.
    pub fn password_reset() -> Self {
        Self {
            window_secs: 60 * 60,
            restrictive_quota: 3,
            relaxed_quota: 30,
            count_only_failures: false,
            message: "Too many password reset attempts, please try again later.".to_string(),
            header_mode: None,
        }
    }

    pub fn quota(&self, mode: OperatingMode) -> u32 {
        match mode {
            OperatingMode::Restrictive => self.restrictive_quota,
            OperatingMode::Relaxed => self.relaxed_quota,
        }
    }
}

impl TurnstileConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.throttle.validate()
    }

    /// Load configuration from defaults, an optional YAML file, and
    /// `TURNSTILE__`-prefixed environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&TurnstileConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder
                .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: TurnstileConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MODE_ENV_VAR;
    use parking_lot::Mutex;

    /// Serializes tests that touch the process environment.
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    fn temp_config(name: &str, contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("turnstile-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("turnstile.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_tier_table() {
        let tiers = TierTable::default();

        assert_eq!(tiers.general.window_secs, 900);
        assert_eq!(tiers.general.quota(OperatingMode::Restrictive), 100);
        assert_eq!(tiers.general.quota(OperatingMode::Relaxed), 1000);
        assert!(!tiers.general.count_only_failures);

        assert_eq!(tiers.authentication.window_secs, 900);
        assert_eq!(tiers.authentication.quota(OperatingMode::Restrictive), 5);
        assert_eq!(tiers.authentication.quota(OperatingMode::Relaxed), 100);
        assert!(tiers.authentication.count_only_failures);

        assert_eq!(tiers.password_reset.window_secs, 3600);
        assert_eq!(tiers.password_reset.quota(OperatingMode::Restrictive), 3);
        assert_eq!(tiers.password_reset.quota(OperatingMode::Relaxed), 30);
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = TurnstileConfig::from_yaml("throttle:\n  mode: restrictive\n").unwrap();

        assert_eq!(config.throttle.mode, OperatingMode::Restrictive);
        assert_eq!(config.throttle.header_mode, HeaderMode::Standard);
        assert_eq!(config.throttle.forwarded, ForwardedSource::None);
        assert_eq!(config.server.http_addr, default_http_addr());
        assert_eq!(config.server.sweep_interval_secs, 60);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  http_addr: 0.0.0.0:9000
  sweep_interval_secs: 30
throttle:
  mode: relaxed
  header_mode: legacy
  forwarded:
    source: x_forwarded_for
    hops: 2
  ipv6_prefix: 64
  tiers:
    password_reset:
      window_secs: 7200
      restrictive_quota: 2
      relaxed_quota: 20
      message: "Slow down"
      header_mode: standard
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.server.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.throttle.forwarded, ForwardedSource::XForwardedFor { hops: 2 });
        assert_eq!(config.throttle.ipv6_prefix, Some(64));
        assert_eq!(config.throttle.tiers.general, TierSettings::general());

        let reset = config.throttle.policy(Tier::PasswordReset).unwrap();
        assert_eq!(reset.quota(), 20);
        assert_eq!(reset.message(), "Slow down");
        assert_eq!(reset.header_mode(), HeaderMode::Standard);

        let general = config.throttle.policy(Tier::General).unwrap();
        assert_eq!(general.header_mode(), HeaderMode::Legacy);
        assert_eq!(general.quota(), 1000);
    }

    #[test]
    fn test_parse_header_forwarded_source() {
        let yaml = r#"
throttle:
  mode: restrictive
  forwarded:
    source: header
    name: x-real-ip
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.throttle.forwarded,
            ForwardedSource::Header {
                name: "x-real-ip".to_string()
            }
        );
    }

    #[test]
    fn test_zero_quota_is_rejected() {
        let yaml = r#"
throttle:
  mode: restrictive
  tiers:
    authentication:
      window_secs: 900
      restrictive_quota: 0
      relaxed_quota: 100
      message: "nope"
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(ref msg) if msg.contains("authentication")));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let mut config = ThrottleConfig {
            mode: OperatingMode::Relaxed,
            ..Default::default()
        };
        config.tiers.general.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_ipv6_prefix_is_rejected() {
        let config = ThrottleConfig {
            mode: OperatingMode::Relaxed,
            ipv6_prefix: Some(129),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_hops_is_rejected() {
        let config = ThrottleConfig {
            mode: OperatingMode::Relaxed,
            forwarded: ForwardedSource::XForwardedFor { hops: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let yaml = "server:\n  sweep_interval_secs: 0\nthrottle:\n  mode: relaxed\n";
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(ref msg) if msg.contains("sweep_interval_secs")));

        let config = TurnstileConfig {
            server: ServerConfig {
                sweep_interval_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file_without_environment() {
        let _guard = ENV_LOCK.lock();
        let path = temp_config("file", "throttle:\n  mode: restrictive\n  header_mode: legacy\n");

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        assert_eq!(config.throttle.mode, OperatingMode::Restrictive);
        assert_eq!(config.throttle.header_mode, HeaderMode::Legacy);
        assert_eq!(config.throttle.tiers.authentication, TierSettings::authentication());

        let same = TurnstileConfig::from_file(&path).unwrap();
        assert_eq!(same.throttle.header_mode, HeaderMode::Legacy);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_environment_overrides_file() {
        let _guard = ENV_LOCK.lock();
        let path = temp_config("env", "throttle:\n  mode: relaxed\n");

        std::env::set_var("TURNSTILE__THROTTLE__MODE", "restrictive");
        std::env::set_var("TURNSTILE__SERVER__SWEEP_INTERVAL_SECS", "15");
        let result = TurnstileConfig::load(Some(&path));
        std::env::remove_var("TURNSTILE__THROTTLE__MODE");
        std::env::remove_var("TURNSTILE__SERVER__SWEEP_INTERVAL_SECS");

        let config = result.unwrap();
        assert_eq!(config.throttle.mode, OperatingMode::Restrictive);
        assert_eq!(config.server.sweep_interval(), Duration::from_secs(15));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_mode_resolves_from_app_env_at_load() {
        let _guard = ENV_LOCK.lock();

        std::env::set_var(MODE_ENV_VAR, "production");
        let production = TurnstileConfig::load(None);
        std::env::set_var(MODE_ENV_VAR, "staging");
        let staging = TurnstileConfig::load(None);
        std::env::remove_var(MODE_ENV_VAR);

        assert_eq!(production.unwrap().throttle.mode, OperatingMode::Restrictive);
        assert_eq!(staging.unwrap().throttle.mode, OperatingMode::Relaxed);
    }

    #[test]
    fn test_configured_mode_wins_over_app_env() {
        let _guard = ENV_LOCK.lock();

        std::env::set_var(MODE_ENV_VAR, "production");
        let config = TurnstileConfig::from_yaml("throttle:\n  mode: relaxed\n");
        std::env::remove_var(MODE_ENV_VAR);

        assert_eq!(config.unwrap().throttle.mode, OperatingMode::Relaxed);
    }
}
