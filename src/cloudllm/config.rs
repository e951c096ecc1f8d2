//! Runtime configuration.
//!
//! Provides [`RuntimeConfig`] for selecting a broker implementation and tuning the router's join
//! behavior. Users construct this manually — no file-parsing dependency (TOML/YAML/etc.) is
//! introduced; that stays true to how the donor [`CloudLLMConfig`] was built, just aimed at a
//! different set of knobs.
//!
//! # Example
//!
//! ```rust
//! use cloudllm::config::{RuntimeConfig, BrokerMode};
//! use std::time::Duration;
//!
//! let config = RuntimeConfig {
//!     broker_mode: BrokerMode::InMemory,
//!     join_timeout: Duration::from_secs(30),
//!     ..RuntimeConfig::default()
//! };
//! ```

use std::time::Duration;

/// Which [`Broker`](crate::cloudllm::broker::Broker) implementation the runner constructs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMode {
    /// In-process `tokio`-channel broker; the default for development and tests.
    InMemory,
    /// TCP mesh broker bound to `bind_addr`, optionally connecting out to `peer_addrs`.
    Networked {
        bind_addr: String,
        peer_addrs: Vec<String>,
    },
}

/// Global configuration for the routing engine.
///
/// Intentionally minimal; users construct it however they want, and no config-file parsing
/// dependency is introduced.
///
/// # Example
///
/// ```rust
/// use cloudllm::config::RuntimeConfig;
///
/// let config = RuntimeConfig::default();
/// assert_eq!(config.in_memory_channel_capacity, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Which broker implementation the runner constructs.
    pub broker_mode: BrokerMode,
    /// Bounded channel capacity per topic for [`InMemoryBroker`](crate::cloudllm::broker::InMemoryBroker).
    pub in_memory_channel_capacity: usize,
    /// How long the agent router's join buffer waits for every expected tool result of a
    /// `(trace_id, response_id)` pair before evicting it and surfacing a
    /// [`RouterError::JoinTimeout`](crate::cloudllm::error::RouterError::JoinTimeout).
    pub join_timeout: Duration,
    /// How often the join buffer sweeps for timed-out entries.
    pub join_sweep_interval: Duration,
    /// Maximum publish retry attempts before a node runner gives up and emits
    /// [`RunnerEvent::PublishAbandoned`](crate::cloudllm::event::RunnerEvent::PublishAbandoned).
    pub publish_max_retries: usize,
    /// Base delay for the node runner's exponential backoff between publish retries.
    pub publish_retry_base_delay: Duration,
}

impl Default for RuntimeConfig {
    /// In-memory broker, a 1024-message channel per topic, a 30s join timeout swept every 5s, and
    /// up to 5 publish retries starting at 100ms.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cloudllm::config::{RuntimeConfig, BrokerMode};
    ///
    /// let config = RuntimeConfig::default();
    /// assert_eq!(config.broker_mode, BrokerMode::InMemory);
    /// ```
    fn default() -> Self {
        Self {
            broker_mode: BrokerMode::InMemory,
            in_memory_channel_capacity: 1024,
            join_timeout: Duration::from_secs(30),
            join_sweep_interval: Duration::from_secs(5),
            publish_max_retries: 5,
            publish_retry_base_delay: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_selects_in_memory_broker() {
        assert_eq!(RuntimeConfig::default().broker_mode, BrokerMode::InMemory);
    }
}
