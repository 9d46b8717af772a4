//! Linear reconnection backoff

use crate::config::ReconnectConfig;

use std::time::Duration;

/// Reconnect after `base_delay × attempt`, giving up after `max_attempts`
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_attempts: u32,
    connect_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32, connect_timeout: Duration) -> Self {
        Self {
            base_delay,
            max_attempts,
            connect_timeout,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config.base_delay(),
            config.max_attempts,
            config.connect_timeout(),
        )
    }

    /// Delay before reconnection attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}
