use statebridge_core::BridgeConfig;
use std::time::Duration;

/// Sender-side timeouts and buffering.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Safety timeout after which an unacknowledged dispatch is released.
    pub dispatch_timeout: Duration,
    pub registration_timeout: Duration,
    /// Timeout for subscription, operations and state queries.
    pub query_timeout: Duration,
    /// Capacity of the update broadcast; slow `updates()` readers lag past it.
    pub update_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_bridge_config(&BridgeConfig::default())
    }
}

impl ClientConfig {
    pub fn from_bridge_config(config: &BridgeConfig) -> Self {
        Self {
            dispatch_timeout: config.dispatch_timeout(),
            registration_timeout: config.registration_timeout(),
            query_timeout: config.registration_timeout(),
            update_buffer: 64,
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_timeouts_from_bridge_config() {
        let bridge = BridgeConfig {
            dispatch_timeout_ms: 1_500,
            registration_timeout_ms: 250,
            ..Default::default()
        };
        let config = ClientConfig::from_bridge_config(&bridge);
        assert_eq!(config.dispatch_timeout, Duration::from_millis(1_500));
        assert_eq!(config.registration_timeout, Duration::from_millis(250));
        assert_eq!(config.query_timeout, Duration::from_millis(250));
    }

    #[test]
    fn default_matches_platform_dispatch_timeout() {
        let config = ClientConfig::default();
        assert_eq!(
            config.dispatch_timeout,
            BridgeConfig::default().dispatch_timeout()
        );
    }
}
