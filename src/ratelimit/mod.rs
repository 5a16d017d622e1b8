//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod key;
mod limiter;
mod memory;
mod policy;
#[cfg(feature = "redis")]
mod redis_store;
mod request;
mod routes;
mod store;

pub use bucket::TokenBucket;
pub use clock::{Clock, MockClock, SystemClock};
pub use key::{
    BucketKey, KeyResolver, KeySource, KeySourceSpec, KeySpec, RateLimitKey,
    DEFAULT_FORWARDED_HEADER, KEY_SEPARATOR, SUB_SEPARATOR, UNKNOWN_IP,
};
pub use limiter::{Decision, EvaluationState, FailMode, RateLimiter};
pub use memory::{InMemoryBucketStore, MemoryBucket, DEFAULT_PURGE_INTERVAL};
pub use policy::{PolicyRegistry, RateLimitPolicy};
#[cfg(feature = "redis")]
pub use redis_store::{RedisBucketStore, RedisStoreConfig};
pub use request::{EvaluationMarker, RequestAccessor, RequestParts};
pub use routes::{RouteSpec, RouteTable, RouteTableBuilder};
pub use store::{effective_ttl, Bucket, BucketStore, ConsumeOutcome, DEFAULT_BUCKET_TTL};

#[cfg(test)]
pub(crate) use limiter::tests::UnreachableStore;
