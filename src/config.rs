use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::OutboxError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub first_ms: u64,
    pub ceiling_ms: u64,
    pub base: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first_ms: 100,
            ceiling_ms: 10_000,
            base: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub backoff: BackoffConfig,
    pub heartbeat_interval_ms: u64,
    pub decay_time_ms: u64,
    /// Give up on a message after this many failed attempts. `None` retries
    /// until the message is sent, deleted, decays, or the session ends.
    pub max_attempts: Option<u32>,
    pub event_channel_capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            heartbeat_interval_ms: 60_000,
            decay_time_ms: 60 * 60 * 1000,
            max_attempts: None,
            event_channel_capacity: 256,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.backoff.first_ms == 0 {
            return Err(OutboxError::Validation("backoff.first_ms must be > 0".into()));
        }
        if self.backoff.first_ms > self.backoff.ceiling_ms {
            return Err(OutboxError::Validation(
                "backoff.first_ms must not exceed backoff.ceiling_ms".into(),
            ));
        }
        if self.backoff.base < 2 {
            return Err(OutboxError::Validation("backoff.base must be >= 2".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(OutboxError::Validation(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.decay_time_ms == 0 {
            return Err(OutboxError::Validation("decay_time_ms must be > 0".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(OutboxError::Validation(
                "max_attempts must be > 0 when set".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(OutboxError::Validation(
                "event_channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(raw: &str) -> Result<Self, OutboxError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| OutboxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, OutboxError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OutboxError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn decay_time(&self) -> Duration {
        Duration::from_millis(self.decay_time_ms)
    }
}
