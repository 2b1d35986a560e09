//! Engine configuration
//!
//! Owned by the host (preference storage, UI toggles); the engine only
//! consumes it. Changing either radio flag at runtime cycles the engine
//! through a full stop/start.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default deadline for one negotiation attempt (30s)
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 30_000;

/// Errors for configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Attempt timeout must be > 0")]
    InvalidAttemptTimeout,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Master switch mirrored from the host's bluetooth preference
    pub bluetooth_enabled: bool,
    /// Prefer the long-range coded PHY when advertising and scanning
    pub coded_phy_preferred: bool,
    /// Deadline for one negotiation attempt in milliseconds; an unpromoted
    /// slot is released when it expires
    pub attempt_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bluetooth_enabled: true,
            coded_phy_preferred: false,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bluetooth_enabled(mut self, enabled: bool) -> Self {
        self.bluetooth_enabled = enabled;
        self
    }

    pub fn with_coded_phy_preferred(mut self, preferred: bool) -> Self {
        self.coded_phy_preferred = preferred;
        self
    }

    pub fn with_attempt_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.attempt_timeout_ms = timeout_ms;
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidAttemptTimeout);
        }
        Ok(())
    }
}
