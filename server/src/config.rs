//! Configuration management for the deferred server.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// RedPanda/Kafka configuration
    pub redpanda: RedpandaConfig,
    /// Redis configuration (status records and notifications)
    pub redis: RedisConfig,
    /// Channel name resolution
    pub auth: AuthConfig,
    /// Deferral gate and replay settings
    pub deferral: DeferralSettings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Seconds each consumer gets to finish its current envelope on shutdown
    pub shutdown_timeout: u64,
}

/// RedPanda/Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Master switch for deferred execution
    pub enabled: bool,
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Topic carrying deferred requests
    pub topic: String,
    /// Consumer group shared by every replay worker
    pub group_id: String,
    /// Offset policy for a new consumer group: earliest, latest, error
    pub auto_offset_reset: String,
    /// Producer acknowledgement mode: 0, 1, all
    pub producer_acks: String,
    /// Number of replay consumers in this process
    pub consumer_count: usize,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prepended to every status record key
    pub key_prefix: String,
    /// Status record lifetime in seconds, 0 keeps records forever
    pub result_ttl: u64,
}

/// Channel name resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens
    pub jwt_secret: String,
    /// Prefix of notification channel names
    pub channel_prefix: String,
}

/// Deferral gate and replay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralSettings {
    /// Largest request body the gate will capture
    pub max_body_bytes: usize,
    /// Delivery attempts per envelope before it is given up
    pub replay_max_retries: u32,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Missing or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            server: ServerConfig {
                host: string("HOST", "0.0.0.0"),
                port: parsed(&lookup, "PORT", 8080),
                shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT", 30),
            },
            redpanda: RedpandaConfig {
                enabled: parsed(&lookup, "KAFKA_ENABLED", true),
                brokers: string("REDPANDA_BROKERS", "localhost:9092"),
                topic: string("KAFKA_TOPIC_ASYNC_REQUEST", deferred_web::state::DEFAULT_TOPIC),
                group_id: string("KAFKA_GROUP_ID", "deferred-replay"),
                auto_offset_reset: string("KAFKA_AUTO_OFFSET_RESET", "earliest"),
                producer_acks: string("KAFKA_PRODUCER_ACKS", "1"),
                consumer_count: parsed(&lookup, "CONSUMER_COUNT", 4),
            },
            redis: RedisConfig {
                url: string("REDIS_URL", "redis://localhost:6379"),
                key_prefix: string("ASYNC_RESULT_KEY_PREFIX", ""),
                result_ttl: parsed(&lookup, "ASYNC_RESULT_TTL", 86_400), // 1 day
            },
            auth: AuthConfig {
                jwt_secret: string("AUTH_JWT_SECRET", "dev-secret-change-in-production"),
                channel_prefix: string("CHANNEL_PREFIX", deferred_web::channel::DEFAULT_CHANNEL_PREFIX),
            },
            deferral: DeferralSettings {
                max_body_bytes: parsed(&lookup, "MAX_BODY_BYTES", deferred_web::state::DEFAULT_MAX_BODY_BYTES),
                replay_max_retries: parsed(&lookup, "REPLAY_MAX_RETRIES", 3),
            },
        }
    }

    /// Address the HTTP server binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Status record lifetime, `None` when records never expire.
    #[must_use]
    pub const fn result_ttl(&self) -> Option<Duration> {
        match self.redis.result_ttl {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Per-consumer grace period on shutdown.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(config.redpanda.enabled);
        assert_eq!(config.redpanda.topic, "async-request");
        assert_eq!(config.redpanda.auto_offset_reset, "earliest");
        assert_eq!(config.redis.key_prefix, "");
        assert_eq!(config.result_ttl(), Some(Duration::from_secs(86_400)));
        assert_eq!(config.auth.channel_prefix, "user:");
        assert_eq!(config.deferral.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.deferral.replay_max_retries, 3);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "9000"),
            ("KAFKA_ENABLED", "false"),
            ("KAFKA_TOPIC_ASYNC_REQUEST", "shop-updates"),
            ("CONSUMER_COUNT", "10"),
            ("ASYNC_RESULT_KEY_PREFIX", "async:"),
            ("ASYNC_RESULT_TTL", "0"),
            ("CHANNEL_PREFIX", "tenant:"),
        ]);

        assert_eq!(config.server.port, 9000);
        assert!(!config.redpanda.enabled);
        assert_eq!(config.redpanda.topic, "shop-updates");
        assert_eq!(config.redpanda.consumer_count, 10);
        assert_eq!(config.redis.key_prefix, "async:");
        assert_eq!(config.result_ttl(), None);
        assert_eq!(config.auth.channel_prefix, "tenant:");
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = config_from(&[("PORT", "eighty"), ("KAFKA_ENABLED", "yes")]);

        assert_eq!(config.server.port, 8080);
        assert!(config.redpanda.enabled);
    }
}
