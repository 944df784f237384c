//! Shared state of the deferral gate and the result endpoint.

use crate::channel::ChannelResolver;
use crate::dispatch::Dispatcher;
use crate::handlers::result::RESULT_ROUTE;
use deferred_core::{StatusStore, TaskBroker};
use std::sync::Arc;

/// Default topic for deferred requests.
pub const DEFAULT_TOPIC: &str = "async-request";

/// Default bound on a buffered request body (2 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct DeferralConfig {
    /// When `false`, triggered requests run synchronously (with a warning).
    pub enabled: bool,
    /// Broker topic deferred requests are published to.
    pub topic: String,
    /// Largest request body the gate buffers.
    pub max_body_bytes: usize,
    /// Route template of the result endpoint; its path family is never deferred.
    pub result_route: String,
    /// Additional path prefixes that are never deferred.
    pub excluded_prefixes: Vec<String>,
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: DEFAULT_TOPIC.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            result_route: RESULT_ROUTE.to_string(),
            excluded_prefixes: Vec::new(),
        }
    }
}

impl DeferralConfig {
    /// Set whether deferral is available.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the broker topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the body size bound.
    #[must_use]
    pub const fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Never defer paths starting with `prefix`.
    ///
    /// A route template such as `/api/v1/shops/:id/` is cut at its first
    /// parameter segment.
    #[must_use]
    pub fn exclude_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.excluded_prefixes.push(prefix.into());
        self
    }
}

/// State shared by the gate and the result endpoint.
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct DeferredState {
    /// Gate configuration.
    pub config: Arc<DeferralConfig>,
    /// Publishes captured requests.
    pub dispatcher: Dispatcher,
    /// Maps callers to channels.
    pub resolver: Arc<dyn ChannelResolver>,
    /// Task status records.
    pub store: Arc<dyn StatusStore>,
}

impl DeferredState {
    /// Assemble the state from its collaborators.
    #[must_use]
    pub fn new(
        config: DeferralConfig,
        broker: Arc<dyn TaskBroker>,
        store: Arc<dyn StatusStore>,
        resolver: Arc<dyn ChannelResolver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Dispatcher::new(broker),
            resolver,
            store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone + Send + Sync>() {}
        assert_clone::<DeferredState>();
    }

    #[test]
    fn test_config_defaults() {
        let config = DeferralConfig::default();
        assert!(config.enabled);
        assert_eq!(config.topic, "async-request");
        assert_eq!(config.result_route, "/api/v1/async_background_response/:task_id/");
        assert!(config.excluded_prefixes.is_empty());
    }
}
