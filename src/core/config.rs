//! Configuration for the sync engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{SyncError, SyncResult};

/// Env var overriding the playback frame interval (milliseconds).
pub const ENV_FRAME_MS: &str = "CHAT_SYNC_FRAME_MS";
/// Env var overriding the playback rate cap (characters per second).
pub const ENV_RATE_CAP: &str = "CHAT_SYNC_RATE_CAP";
/// Env var overriding the pending-operation soft timeout (milliseconds).
pub const ENV_SOFT_TIMEOUT_MS: &str = "CHAT_SYNC_SOFT_TIMEOUT_MS";

/// Top-level configuration for the sync engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Typewriter playback settings.
    #[serde(default)]
    pub playback: PlaybackConfig,
    /// Command bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl SyncConfig {
    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> SyncResult<()> {
        let playback = &self.playback;
        if !(playback.base_rate.is_finite() && playback.base_rate > 0.0) {
            return Err(SyncError::InvalidConfig(
                "playback.base_rate must be > 0".to_string(),
            ));
        }

        if playback.sqrt_gain < 0.0 || playback.linear_gain < 0.0 {
            return Err(SyncError::InvalidConfig(
                "playback gains must be >= 0".to_string(),
            ));
        }

        if playback.rate_cap < playback.base_rate {
            return Err(SyncError::InvalidConfig(
                "playback.rate_cap must be >= playback.base_rate".to_string(),
            ));
        }

        if playback.frame_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "playback.frame_interval must be > 0".to_string(),
            ));
        }

        if self.bridge.soft_timeout.is_zero() {
            return Err(SyncError::InvalidConfig(
                "bridge.soft_timeout must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    /// Returns an error if the resulting configuration is invalid.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>(ENV_FRAME_MS) {
            config.playback.frame_interval = Duration::from_millis(ms);
        }
        if let Some(cap) = env_parse::<f64>(ENV_RATE_CAP) {
            config.playback.rate_cap = cap;
        }
        if let Some(ms) = env_parse::<u64>(ENV_SOFT_TIMEOUT_MS) {
            config.bridge.soft_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Typewriter playback settings.
///
/// Release rate per tick is
/// `min(rate_cap, base_rate + sqrt_gain * sqrt(backlog) + linear_gain * backlog)`
/// characters per second.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Rate for a tiny backlog (chars/s).
    pub base_rate: f64,
    /// Weight of the square-root backlog term.
    pub sqrt_gain: f64,
    /// Weight of the linear backlog term.
    pub linear_gain: f64,
    /// Hard ceiling on the release rate (chars/s).
    pub rate_cap: f64,
    /// Interval between playback ticks.
    #[serde(with = "duration_ms")]
    pub frame_interval: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            base_rate: 40.0,
            sqrt_gain: 8.0,
            linear_gain: 2.0,
            rate_cap: 4000.0,
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Command bridge settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// After this long a pending operation is reported as slow (UI only).
    #[serde(with = "duration_ms")]
    pub soft_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            soft_timeout: Duration::from_secs(10),
        }
    }
}

/// Serde module for `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
