//! Bucket store traits for abstracting local and distributed state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::key::BucketKey;
use super::policy::RateLimitPolicy;
use crate::error::Result;

/// Default lifetime of a stored bucket, measured from its creation.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Result of one consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Whether the tokens were taken
    pub granted: bool,
    /// Whole tokens left after the attempt
    pub available_tokens: u64,
}

/// A handle to one stored token bucket.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Atomically refill and take `tokens` if available.
    async fn try_consume(&self, tokens: u64) -> Result<ConsumeOutcome>;

    /// Tokens currently available, after refill, without consuming.
    async fn available_tokens(&self) -> Result<u64>;
}

/// Shared storage of token buckets, one per bucket key.
///
/// Implementations must make `get_or_create` an atomic compute-if-absent and
/// `consume` atomic per key, so concurrent callers on one key neither lose
/// decrements nor double-grant.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the bucket for `key`, creating it full under `policy` if absent.
    ///
    /// If the stored bucket was built with a different policy, its bandwidth
    /// is swapped to `policy` as part of the same atomic step.
    async fn get_or_create(&self, key: &BucketKey, policy: &RateLimitPolicy)
        -> Result<Arc<dyn Bucket>>;

    /// Take `tokens` from the bucket for `key`.
    async fn consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        tokens: u64,
    ) -> Result<ConsumeOutcome> {
        self.get_or_create(key, policy).await?.try_consume(tokens).await
    }
}

/// Lifetime of a stored bucket: the configured TTL, but never shorter than
/// one refill period of its policy.
pub fn effective_ttl(configured: Duration, policy: &RateLimitPolicy) -> Duration {
    configured.max(policy.refill_period())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_ttl_never_below_refill_period() {
        let hourly = RateLimitPolicy::new(5, 5, 3600).unwrap();
        let minutely = RateLimitPolicy::new(5, 5, 60).unwrap();

        assert_eq!(
            effective_ttl(Duration::from_secs(600), &hourly),
            Duration::from_secs(3600)
        );
        assert_eq!(
            effective_ttl(Duration::from_secs(600), &minutely),
            Duration::from_secs(600)
        );
    }
}
