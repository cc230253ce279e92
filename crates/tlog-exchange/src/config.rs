//! Exchange tuning knobs.

use std::time::Duration;

/// Configuration for a single exchange and the outer exchange loop.
#[derive(Clone, Debug)]
pub struct ExchangeConfig {
    /// Capacity of the dispatcher-to-service request queue.
    pub service_queue_depth: usize,
    /// Capacity of the dispatcher-to-merge response queue.
    pub merge_queue_depth: usize,
    /// How long the merge waits for any single response.
    pub round_trip_timeout: Duration,
    /// How long teardown waits for sub-protocols before aborting them.
    pub teardown_grace: Duration,
    /// Pause between consecutive exchanges.
    pub cooldown: Duration,
    /// Largest frame a stream channel accepts.
    pub max_frame_size: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            service_queue_depth: 3,
            merge_queue_depth: 1,
            round_trip_timeout: Duration::from_secs(30),
            teardown_grace: Duration::from_secs(5),
            cooldown: Duration::from_secs(120),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl ExchangeConfig {
    pub fn builder() -> ExchangeConfigBuilder {
        ExchangeConfigBuilder::new()
    }
}

/// Builder for exchange configuration.
pub struct ExchangeConfigBuilder {
    config: ExchangeConfig,
}

impl ExchangeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ExchangeConfig::default(),
        }
    }

    pub fn service_queue_depth(mut self, depth: usize) -> Self {
        self.config.service_queue_depth = depth.max(1);
        self
    }

    pub fn merge_queue_depth(mut self, depth: usize) -> Self {
        self.config.merge_queue_depth = depth.max(1);
        self
    }

    pub fn round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.config.round_trip_timeout = timeout;
        self
    }

    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    pub fn build(self) -> ExchangeConfig {
        self.config
    }
}

impl Default for ExchangeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ExchangeConfig::builder()
            .cooldown(Duration::ZERO)
            .merge_queue_depth(0)
            .round_trip_timeout(Duration::from_millis(250))
            .build();
        assert_eq!(config.cooldown, Duration::ZERO);
        assert_eq!(config.merge_queue_depth, 1);
        assert_eq!(config.round_trip_timeout, Duration::from_millis(250));
        assert_eq!(config.service_queue_depth, ExchangeConfig::default().service_queue_depth);
    }
}
