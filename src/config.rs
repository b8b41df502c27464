//! Orchestrator configuration.
//!
//! Values come from [`OrchestratorConfig::default`], `LIFELINE_*` environment
//! variables, or a JSON file. Every loader validates before returning.
//!
//! | Variable                                 | Default  |
//! |------------------------------------------|----------|
//! | `LIFELINE_AUTO_CONNECT`                  | `true`   |
//! | `LIFELINE_REQUIRE_EXPLICIT_CONSENT`      | `true`   |
//! | `LIFELINE_ENABLE_FOLLOW_UP`              | `true`   |
//! | `LIFELINE_ENABLE_FALLBACK`               | `true`   |
//! | `LIFELINE_SAMPLING_INTERVAL_MS`          | `10000`  |
//! | `LIFELINE_RECONNECT_DELAY_MS`            | `5000`   |
//! | `LIFELINE_FOLLOW_UP_HORIZON_SECS`        | `86400`  |
//! | `LIFELINE_DIAL_TIMEOUT_MS`               | `30000`  |
//! | `LIFELINE_POOR_QUALITY_THRESHOLD`        | `0.3`    |
//! | `LIFELINE_POOR_SAMPLES_BEFORE_RECONNECT` | `3`      |
//! | `LIFELINE_PRIMARY_CHANNEL`               | `voice`  |
//! | `LIFELINE_FALLBACK_CHANNEL`              | `text`   |
//! | `LIFELINE_STATS_WINDOW`                  | `1000`   |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::gateway::ChannelKind;

/// Runtime configuration for the session orchestrator and its helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Connect automatically for critical and imminent severities.
    pub auto_connect: bool,
    /// Refuse to connect users without a consent record.
    pub require_explicit_consent: bool,
    /// Schedule a welfare check after each session ends.
    pub enable_follow_up: bool,
    /// Try the fallback channel once when the primary dial fails.
    pub enable_fallback: bool,
    /// Interval between connection quality samples (milliseconds).
    pub sampling_interval_ms: u64,
    /// Delay before the single automatic reconnect attempt (milliseconds).
    pub reconnect_delay_ms: u64,
    /// Default delay between session end and its follow-up (seconds).
    pub follow_up_horizon_secs: u64,
    /// Upper bound on a single dial (milliseconds).
    pub dial_timeout_ms: u64,
    /// Quality samples strictly below this value are poor (0.0 to 1.0).
    pub poor_quality_threshold: f64,
    /// Consecutive poor samples that trigger a reconnect.
    pub poor_samples_before_reconnect: u32,
    pub primary_channel: ChannelKind,
    pub fallback_channel: ChannelKind,
    /// Number of ended sessions kept for statistics.
    pub stats_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            require_explicit_consent: true,
            enable_follow_up: true,
            enable_fallback: true,
            sampling_interval_ms: 10_000,
            reconnect_delay_ms: 5_000,
            follow_up_horizon_secs: 24 * 60 * 60,
            dial_timeout_ms: 30_000,
            poor_quality_threshold: 0.3,
            poor_samples_before_reconnect: 3,
            primary_channel: ChannelKind::Voice,
            fallback_channel: ChannelKind::Text,
            stats_window: 1_000,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from `LIFELINE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "LIFELINE_AUTO_CONNECT")? {
            config.auto_connect = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_REQUIRE_EXPLICIT_CONSENT")? {
            config.require_explicit_consent = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_ENABLE_FOLLOW_UP")? {
            config.enable_follow_up = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_ENABLE_FALLBACK")? {
            config.enable_fallback = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_SAMPLING_INTERVAL_MS")? {
            config.sampling_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_RECONNECT_DELAY_MS")? {
            config.reconnect_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_FOLLOW_UP_HORIZON_SECS")? {
            config.follow_up_horizon_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_DIAL_TIMEOUT_MS")? {
            config.dial_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_POOR_QUALITY_THRESHOLD")? {
            config.poor_quality_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_POOR_SAMPLES_BEFORE_RECONNECT")? {
            config.poor_samples_before_reconnect = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_PRIMARY_CHANNEL")? {
            config.primary_channel = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_FALLBACK_CHANNEL")? {
            config.fallback_channel = v;
        }
        if let Some(v) = parse_var(&lookup, "LIFELINE_STATS_WINDOW")? {
            config.stats_window = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. Missing fields keep defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.poor_quality_threshold) {
            return Err(invalid(
                "poor_quality_threshold",
                format!("must be within 0.0..=1.0, got {}", self.poor_quality_threshold),
            ));
        }
        if self.sampling_interval_ms == 0 {
            return Err(invalid("sampling_interval_ms", "must be greater than zero"));
        }
        if self.dial_timeout_ms == 0 {
            return Err(invalid("dial_timeout_ms", "must be greater than zero"));
        }
        if self.poor_samples_before_reconnect == 0 {
            return Err(invalid(
                "poor_samples_before_reconnect",
                "must be at least 1",
            ));
        }
        if self.stats_window == 0 {
            return Err(invalid("stats_window", "must be at least 1"));
        }
        if self.enable_fallback && self.primary_channel == self.fallback_channel {
            return Err(invalid(
                "fallback_channel",
                format!(
                    "must differ from primary_channel ({}) when fallback is enabled",
                    self.primary_channel
                ),
            ));
        }
        Ok(())
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn follow_up_horizon(&self) -> Duration {
        Duration::from_secs(self.follow_up_horizon_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, format!("'{}': {}", raw, e))),
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
