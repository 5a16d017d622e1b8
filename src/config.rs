//! Configuration management for Ratekeeper.
//!
//! Configuration is read from a YAML file and then overlaid with
//! `RATEKEEPER__`-prefixed environment variables, `__` separating nested
//! keys (e.g. `RATEKEEPER__STORE__BACKEND=redis`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{
    BucketStore, FailMode, InMemoryBucketStore, KeyResolver, PolicyRegistry, RateLimitPolicy,
    RateLimiter, RouteSpec, RouteTable, DEFAULT_FORWARDED_HEADER,
};

/// Prefix of environment variables overriding file settings.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateKeeperConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Policies and protected routes
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Policy for routes without an override
    #[serde(default = "default_policy")]
    pub default_policy: RateLimitPolicy,

    /// Per-route policy overrides
    #[serde(default)]
    pub route_policies: HashMap<String, RateLimitPolicy>,

    /// Protected routes and their key sources
    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    /// Header carrying the original client address
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy(),
            route_policies: HashMap::new(),
            routes: Vec::new(),
            forwarded_header: default_forwarded_header(),
        }
    }
}

fn default_policy() -> RateLimitPolicy {
    RateLimitPolicy {
        capacity: 100,
        refill_tokens: 100,
        refill_period_secs: 60,
    }
}

fn default_forwarded_header() -> String {
    DEFAULT_FORWARDED_HEADER.to_string()
}

/// Which bucket store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local buckets
    #[default]
    Memory,
    /// Buckets shared through Redis
    Redis,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix of bucket keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bucket lifetime from creation, in seconds
    #[serde(default = "default_bucket_ttl")]
    pub bucket_ttl_secs: u64,

    /// Behavior when the store cannot be reached
    #[serde(default)]
    pub on_unavailable: FailMode,

    /// Timeout of one Redis connection attempt, in milliseconds
    #[serde(default = "default_redis_connect_timeout")]
    pub redis_connect_timeout_ms: u64,

    /// Redis reconnection attempts before giving up
    #[serde(default = "default_redis_max_retries")]
    pub redis_max_retries: usize,

    /// Upper bound of the Redis reconnection backoff, in milliseconds
    #[serde(default = "default_redis_max_retry_delay")]
    pub redis_max_retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            bucket_ttl_secs: default_bucket_ttl(),
            on_unavailable: FailMode::default(),
            redis_connect_timeout_ms: default_redis_connect_timeout(),
            redis_max_retries: default_redis_max_retries(),
            redis_max_retry_delay_ms: default_redis_max_retry_delay(),
        }
    }
}

fn default_key_prefix() -> String {
    "ratekeeper:".to_string()
}

fn default_bucket_ttl() -> u64 {
    3600
}

fn default_redis_connect_timeout() -> u64 {
    2000
}

fn default_redis_max_retries() -> usize {
    3
}

fn default_redis_max_retry_delay() -> u64 {
    1000
}

impl StoreConfig {
    pub fn bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_ttl_secs)
    }

    /// Settings for the Redis store, connection bounds included.
    #[cfg(feature = "redis")]
    pub fn redis_store_config(&self) -> crate::ratelimit::RedisStoreConfig {
        crate::ratelimit::RedisStoreConfig {
            key_prefix: self.key_prefix.clone(),
            ttl: self.bucket_ttl(),
            connection_timeout: Duration::from_millis(self.redis_connect_timeout_ms),
            max_retries: self.redis_max_retries,
            max_retry_delay: Duration::from_millis(self.redis_max_retry_delay_ms),
        }
    }
}

impl RateKeeperConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
    ///
    /// Runs before any subscriber is installed (the logging settings come
    /// from this file), so it reports through its result only.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: RateKeeperConfig = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateKeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateKeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check policies, routes and store settings.
    pub fn validate(&self) -> Result<()> {
        self.build_registry()?;
        self.build_routes()?;

        if self.rate_limiting.forwarded_header.trim().is_empty() {
            return Err(RateKeeperError::Config("forwarded_header must not be empty".into()));
        }
        if self.store.bucket_ttl_secs == 0 {
            return Err(RateKeeperError::Config("bucket_ttl_secs must be >= 1".into()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(RateKeeperError::Config("redis backend requires redis_url".into()));
        }
        Ok(())
    }

    /// Policy registry from the default policy and route overrides.
    pub fn build_registry(&self) -> Result<PolicyRegistry> {
        PolicyRegistry::with_overrides(
            self.rate_limiting.default_policy,
            self.rate_limiting.route_policies.clone(),
        )
    }

    /// Route table from the declared routes.
    pub fn build_routes(&self) -> Result<RouteTable> {
        RouteTable::from_specs(self.rate_limiting.routes.iter().cloned())
    }

    pub fn key_resolver(&self) -> KeyResolver {
        KeyResolver::with_forwarded_header(self.rate_limiting.forwarded_header.clone())
    }

    /// Connect the configured bucket store.
    pub async fn build_store(&self) -> Result<Arc<dyn BucketStore>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryBucketStore::with_ttl(
                self.store.bucket_ttl(),
            ))),
            StoreBackend::Redis => self.connect_redis().await,
        }
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(&self) -> Result<Arc<dyn BucketStore>> {
        use crate::ratelimit::RedisBucketStore;

        let url = self
            .store
            .redis_url
            .as_deref()
            .ok_or_else(|| RateKeeperError::Config("redis backend requires redis_url".into()))?;
        let store =
            RedisBucketStore::connect_with_config(url, self.store.redis_store_config()).await?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(&self) -> Result<Arc<dyn BucketStore>> {
        Err(RateKeeperError::Config(
            "redis backend requested but built without the `redis` feature".into(),
        ))
    }

    /// Assemble a rate limiter from this configuration.
    pub async fn build_limiter(&self) -> Result<RateLimiter> {
        let store = self.build_store().await?;
        Ok(
            RateLimiter::new(self.build_registry()?, self.build_routes()?, store)
                .with_resolver(self.key_resolver())
                .with_fail_mode(self.store.on_unavailable),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::KeySource;

    const SAMPLE: &str = r#"
logging:
  level: debug
rate_limiting:
  default_policy:
    capacity: 5
    refill_tokens: 5
    refill_period_secs: 60
  route_policies:
    search:
      capacity: 20
      refill_tokens: 10
      refill_period_secs: 1
  routes:
    - route: orders
      keys:
        - source: header
          names: [X-Client-Id]
    - route: login
      limit:
        capacity: 3
        refill_tokens: 3
        refill_period_secs: 300
      keys:
        - source: body_field
          names: [username]
    - route: search
store:
  backend: memory
  bucket_ttl_secs: 600
  on_unavailable: fail_open
"#;

    #[test]
    fn test_defaults() {
        let config = RateKeeperConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.rate_limiting.default_policy.capacity, 100);
        assert_eq!(config.rate_limiting.forwarded_header, "X-Forwarded-For");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.bucket_ttl_secs, 3600);
        assert_eq!(config.store.on_unavailable, FailMode::FailClosed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = RateKeeperConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.rate_limiting.default_policy,
            RateLimitPolicy::new(5, 5, 60).unwrap()
        );
        assert_eq!(config.rate_limiting.routes.len(), 3);
        assert_eq!(config.store.bucket_ttl_secs, 600);
        assert_eq!(config.store.on_unavailable, FailMode::FailOpen);

        let routes = config.build_routes().unwrap();
        let orders = routes.get("orders").unwrap();
        assert_eq!(orders.keys.sources()[0].source, KeySource::Header);
        assert!(routes.get("search").unwrap().keys.sources().is_empty());

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.get_policy("search").capacity, 20);
        assert_eq!(registry.get_policy("orders").capacity, 5);
    }

    #[test]
    fn test_invalid_default_policy_rejected() {
        let yaml = r#"
rate_limiting:
  default_policy:
    capacity: 0
    refill_tokens: 5
    refill_period_secs: 60
"#;
        let result = RateKeeperConfig::from_yaml(yaml);
        assert!(matches!(result, Err(RateKeeperError::InvalidPolicy(_))));
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let yaml = r#"
store:
  backend: redis
"#;
        let result = RateKeeperConfig::from_yaml(yaml);
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[cfg(feature = "redis")]
    #[test]
    fn test_redis_connection_bounds() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://127.0.0.1:1/
  redis_connect_timeout_ms: 250
  redis_max_retries: 1
"#;
        let config = RateKeeperConfig::from_yaml(yaml).unwrap();
        let redis = config.store.redis_store_config();

        assert_eq!(redis.connection_timeout, Duration::from_millis(250));
        assert_eq!(redis.max_retries, 1);
        assert_eq!(redis.max_retry_delay, Duration::from_millis(1000));
        assert_eq!(redis.key_prefix, "ratekeeper:");
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_unreachable_redis_fails_startup_quickly() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://127.0.0.1:1/
  redis_connect_timeout_ms: 200
  redis_max_retries: 1
  redis_max_retry_delay_ms: 50
"#;
        let config = RateKeeperConfig::from_yaml(yaml).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), config.build_limiter())
            .await
            .expect("startup should not stall on a dead server");
        assert!(matches!(result, Err(RateKeeperError::StoreUnavailable(_))));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = RateKeeperConfig::from_yaml("rate_limiting: [not, a, map");
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[test]
    fn test_from_file_with_env_override() {
        let path =
            std::env::temp_dir().join(format!("ratekeeper-test-{}.yaml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();
        std::env::set_var("RATEKEEPER__STORE__BUCKET_TTL_SECS", "900");

        let config = RateKeeperConfig::from_file(&path);
        std::env::remove_var("RATEKEEPER__STORE__BUCKET_TTL_SECS");
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.store.bucket_ttl_secs, 900);
        assert_eq!(config.rate_limiting.default_policy.capacity, 5);
        assert_eq!(config.rate_limiting.routes.len(), 3);
    }

    #[test]
    fn test_from_missing_file() {
        let result = RateKeeperConfig::from_file("/nonexistent/ratekeeper.yaml");
        assert!(matches!(result, Err(RateKeeperError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_limiter_from_config() {
        let config = RateKeeperConfig::from_yaml(SAMPLE).unwrap();
        let limiter = config.build_limiter().await.unwrap();

        assert_eq!(limiter.fail_mode(), FailMode::FailOpen);
        assert_eq!(limiter.routes().len(), 3);
        let login = limiter.routes().get("login").unwrap();
        assert_eq!(limiter.resolve_policy(login).capacity, 3);
    }
}
