//! Distributed bucket store backed by Redis.
//!
//! Every bucket is a Redis hash. A single Lua script creates the bucket if
//! absent, refills it from elapsed server time, swaps its bandwidth when the
//! policy changed, and takes tokens, all inside one atomic script execution.
//! Service instances sharing the Redis server therefore share quotas and
//! never interleave a read with another instance's decrement.
//!
//! The expiry is set once when the hash is created and never refreshed, so a
//! bucket lives a fixed time from creation regardless of traffic.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::key::BucketKey;
use super::policy::RateLimitPolicy;
use super::store::{effective_ttl, Bucket, BucketStore, ConsumeOutcome, DEFAULT_BUCKET_TTL};
use crate::error::{RateKeeperError, Result};

/// KEYS[1]: bucket hash
/// ARGV: capacity, refill_tokens, refill_period_ms, requested, ttl_ms
/// Returns {granted (0/1), whole tokens available}
///
/// Tokens are kept in integer units, `refill_period_ms` units per token, and
/// each elapsed millisecond of server time credits `refill_tokens` units.
/// Lua numbers are doubles, so the arithmetic is exact while
/// `capacity * refill_period_ms` stays below 2^53. A `ttl_ms` of 0 means the
/// bucket never expires.
const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_tokens = tonumber(ARGV[2])
local period_ms = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])
local max_units = capacity * period_ms

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local state = redis.call('HMGET', key, 'units', 'last_refill', 'period_ms')
local units = tonumber(state[1])
local last = tonumber(state[2])
local stored_period = tonumber(state[3])
local created = false

if units == nil or last == nil then
  units = max_units
  last = now
  created = true
else
  if stored_period ~= nil and stored_period ~= period_ms then
    units = math.floor(units * period_ms / stored_period)
  end
  local elapsed = now - last
  if elapsed > 0 then
    units = units + elapsed * refill_tokens
    last = now
  end
  if units > max_units then
    units = max_units
  end
end

local granted = 0
local needed = requested * period_ms
if requested > 0 and units >= needed then
  units = units - needed
  granted = 1
end

redis.call('HSET', key,
  'units', string.format('%.0f', units),
  'last_refill', string.format('%.0f', last),
  'period_ms', string.format('%.0f', period_ms))

if created and ttl_ms > 0 then
  redis.call('PEXPIRE', key, ttl_ms)
end

return {granted, math.floor(units / period_ms)}
"#;

/// Longest expiry handed to Redis, about 35,000 years. Longer TTLs mean the
/// bucket never expires.
const MAX_TTL_MS: u64 = 1 << 50;

/// Expiry argument for the script, 0 when the bucket should not expire.
fn ttl_millis(ttl: Duration) -> u64 {
    match u64::try_from(ttl.as_millis()) {
        Ok(ms) if ms <= MAX_TTL_MS => ms,
        _ => 0,
    }
}

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every bucket key
    pub key_prefix: String,
    /// Lifetime of a bucket from creation
    pub ttl: Duration,
    /// Timeout of a single connection attempt
    pub connection_timeout: Duration,
    /// Reconnection attempts before giving up
    pub max_retries: usize,
    /// Upper bound of the backoff between attempts
    pub max_retry_delay: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratekeeper:".to_string(),
            ttl: DEFAULT_BUCKET_TTL,
            connection_timeout: Duration::from_secs(2),
            max_retries: 3,
            max_retry_delay: Duration::from_secs(1),
        }
    }
}

impl RedisStoreConfig {
    fn connection_manager_config(&self) -> ConnectionManagerConfig {
        let max_delay_ms = u64::try_from(self.max_retry_delay.as_millis()).unwrap_or(u64::MAX);
        ConnectionManagerConfig::new()
            .set_number_of_retries(self.max_retries)
            .set_max_delay(max_delay_ms)
            .set_connection_timeout(self.connection_timeout)
    }
}

struct Shared {
    connection: ConnectionManager,
    script: Script,
    config: RedisStoreConfig,
}

impl Shared {
    async fn run(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        requested: u64,
    ) -> Result<ConsumeOutcome> {
        let store_key = key.to_store_key(&self.config.key_prefix);
        let ttl = effective_ttl(self.config.ttl, policy);
        let mut conn = self.connection.clone();

        let (granted, available): (i64, i64) = self
            .script
            .key(&store_key)
            .arg(policy.capacity)
            .arg(policy.refill_tokens)
            .arg(policy.refill_period_secs.saturating_mul(1000))
            .arg(requested)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(key = %store_key, error = %e, "Redis bucket script failed");
                RateKeeperError::StoreUnavailable(e.to_string())
            })?;

        trace!(
            key = %store_key,
            requested = requested,
            granted = granted,
            available = available,
            "Redis bucket script ran"
        );

        Ok(ConsumeOutcome {
            granted: granted == 1,
            available_tokens: available.max(0) as u64,
        })
    }
}

/// Bucket store shared across service instances through Redis.
#[derive(Clone)]
pub struct RedisBucketStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl RedisBucketStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection =
            ConnectionManager::new_with_config(client, config.connection_manager_config()).await?;

        info!(
            key_prefix = %config.key_prefix,
            ttl_secs = config.ttl.as_secs(),
            "Connected Redis bucket store"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                connection,
                script: Script::new(CONSUME_SCRIPT),
                config,
            }),
        })
    }
}

/// A bucket living in Redis; every call runs the atomic script.
struct RedisBucket {
    shared: Arc<Shared>,
    key: BucketKey,
    policy: RateLimitPolicy,
}

#[async_trait]
impl Bucket for RedisBucket {
    async fn try_consume(&self, tokens: u64) -> Result<ConsumeOutcome> {
        self.shared.run(&self.key, &self.policy, tokens).await
    }

    async fn available_tokens(&self) -> Result<u64> {
        Ok(self.shared.run(&self.key, &self.policy, 0).await?.available_tokens)
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn get_or_create(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
    ) -> Result<Arc<dyn Bucket>> {
        // Zero tokens requested: creates the hash if absent, consumes nothing
        let outcome = self.shared.run(key, policy, 0).await?;
        debug!(key = %key, available = outcome.available_tokens, "Resolved Redis bucket");

        Ok(Arc::new(RedisBucket {
            shared: self.shared.clone(),
            key: key.clone(),
            policy: *policy,
        }))
    }

    async fn consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        tokens: u64,
    ) -> Result<ConsumeOutcome> {
        self.shared.run(key, policy, tokens).await
    }
}
