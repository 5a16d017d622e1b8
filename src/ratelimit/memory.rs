//! In-process bucket store.
//!
//! Buckets live in a sharded concurrent map. The map's entry API gives an
//! atomic compute-if-absent per key, and each bucket sits behind its own
//! mutex so refill-and-consume is linearizable per key. Entries expire a
//! fixed time after creation; expiry is checked lazily on access, and every
//! few hundred new buckets the store sweeps out expired entries itself so
//! one-off keys cannot grow the map without bound. No background task is
//! spawned.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::clock::{Clock, SystemClock};
use super::key::BucketKey;
use super::policy::RateLimitPolicy;
use super::store::{effective_ttl, Bucket, BucketStore, ConsumeOutcome, DEFAULT_BUCKET_TTL};
use crate::error::Result;

/// A token bucket owned by the in-memory store.
pub struct MemoryBucket {
    state: Mutex<TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl MemoryBucket {
    fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(TokenBucket::new(policy, now)),
            clock,
        }
    }

    /// Swap the bandwidth if it differs from `policy`.
    fn ensure_policy(&self, key: &BucketKey, policy: &RateLimitPolicy) {
        let mut state = self.state.lock();
        if state.policy() != *policy {
            debug!(
                key = %key,
                from = %state.policy(),
                to = %policy,
                "Replacing bucket bandwidth"
            );
            state.reconfigure(*policy, self.clock.now());
        }
    }

    fn consume_now(&self, tokens: u64) -> ConsumeOutcome {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let granted = state.try_consume(tokens, now);
        ConsumeOutcome {
            granted,
            available_tokens: state.available_tokens(now),
        }
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn try_consume(&self, tokens: u64) -> Result<ConsumeOutcome> {
        Ok(self.consume_now(tokens))
    }

    async fn available_tokens(&self) -> Result<u64> {
        let mut state = self.state.lock();
        Ok(state.available_tokens(self.clock.now()))
    }
}

/// New buckets created between two sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: usize = 256;

struct StoredBucket {
    bucket: Arc<MemoryBucket>,
    /// `None` when the TTL is too long to represent
    expires_at: Option<Instant>,
}

impl StoredBucket {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bucket store backed by process memory.
pub struct InMemoryBucketStore {
    /// Buckets indexed by route-scoped key
    buckets: DashMap<BucketKey, StoredBucket>,
    /// Configured lifetime of an entry from creation
    ttl: Duration,
    clock: Arc<dyn Clock>,
    purge_interval: usize,
    created_since_purge: AtomicUsize,
}

impl InMemoryBucketStore {
    /// Create a store with the default TTL and the system clock.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_BUCKET_TTL)
    }

    /// Create a store with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create a store with a custom TTL and time source.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            ttl,
            clock,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            created_since_purge: AtomicUsize::new(0),
        }
    }

    /// Sweep expired entries after every `interval` new buckets.
    pub fn with_purge_interval(mut self, interval: usize) -> Self {
        self.purge_interval = interval.max(1);
        self
    }

    fn bucket_for(&self, key: &BucketKey, policy: &RateLimitPolicy) -> Arc<MemoryBucket> {
        let now = self.clock.now();
        let mut created = false;

        let bucket = match self.buckets.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    debug!(key = %key, "Bucket expired, starting fresh");
                    let fresh = self.fresh_entry(policy, now);
                    let bucket = fresh.bucket.clone();
                    occupied.insert(fresh);
                    bucket
                } else {
                    occupied.get().bucket.clone()
                }
            }
            Entry::Vacant(vacant) => {
                debug!(key = %key, policy = %policy, "Creating new bucket");
                created = true;
                vacant.insert(self.fresh_entry(policy, now)).bucket.clone()
            }
        };

        // The entry guard is released; sweeping now cannot deadlock on it
        if created {
            let since_purge = self.created_since_purge.fetch_add(1, Ordering::Relaxed) + 1;
            if since_purge >= self.purge_interval {
                self.created_since_purge.store(0, Ordering::Relaxed);
                self.purge_expired();
            }
        }

        bucket.ensure_policy(key, policy);
        bucket
    }

    fn fresh_entry(&self, policy: &RateLimitPolicy, now: Instant) -> StoredBucket {
        StoredBucket {
            bucket: Arc::new(MemoryBucket::new(*policy, self.clock.clone())),
            expires_at: now.checked_add(effective_ttl(self.ttl, policy)),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();
        self.buckets.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired buckets");
        }
        removed
    }

    /// Number of stored buckets, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Remove all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn get_or_create(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
    ) -> Result<Arc<dyn Bucket>> {
        Ok(self.bucket_for(key, policy))
    }

    async fn consume(
        &self,
        key: &BucketKey,
        policy: &RateLimitPolicy,
        tokens: u64,
    ) -> Result<ConsumeOutcome> {
        let outcome = self.bucket_for(key, policy).consume_now(tokens);
        trace!(
            key = %key,
            granted = outcome.granted,
            available = outcome.available_tokens,
            "Consumed from in-memory bucket"
        );
        Ok(outcome)
    }
}
