//! Sync engine configuration.

use std::time::Duration;

use chatty_protocol::broker_url;

/// How the engine receives remote updates for a conversation.
///
/// Both strategies feed the same timeline; they are mutually exclusive
/// per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Pushed frames over the broker channel plus optimistic local sends.
    #[default]
    Live,
    /// Long-poll loop against the REST delta endpoint. Used when no
    /// broker is reachable from the deployment.
    Polling,
}

/// Configuration for one [`SyncEngine`](crate::engine::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST base URL, e.g. `http://localhost:8080/api`. The broker
    /// endpoint is derived from this.
    pub api_base_url: String,

    /// Delivery strategy.
    pub delivery: DeliveryMode,

    /// Fixed delay between websocket reconnect attempts.
    pub reconnect_delay: Duration,

    /// Outgoing heartbeat interval; also the interval offered to the
    /// broker for its side.
    pub heartbeat_interval: Duration,

    /// Fixed backoff after a failed poll iteration.
    pub poll_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            delivery: DeliveryMode::Live,
            reconnect_delay: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(4000),
            poll_backoff: Duration::from_millis(3000),
        }
    }
}

impl SyncConfig {
    /// The websocket broker endpoint derived from `api_base_url`.
    pub fn broker_url(&self) -> String {
        broker_url(&self.api_base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.delivery, DeliveryMode::Live);
        assert_eq!(config.reconnect_delay, Duration::from_millis(5000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(4000));
        assert_eq!(config.poll_backoff, Duration::from_millis(3000));
        assert_eq!(config.broker_url(), "ws://localhost:8080/ws");
    }
}
