//! Core rate limiter implementation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, trace, warn};

use super::key::{BucketKey, KeyResolver};
use super::policy::{PolicyRegistry, RateLimitPolicy};
use super::request::RequestAccessor;
use super::routes::{RouteSpec, RouteTable};
use super::store::BucketStore;
use crate::error::Result;

/// Progress of one request through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    NotEvaluated,
    KeyResolved,
    BucketResolved,
    Allowed,
    Throttled,
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allowed {
        /// Tokens left for the key, when a bucket was consulted
        remaining: Option<u64>,
    },
    /// The request is over quota
    Throttled {
        /// The composite key that ran out
        key: String,
        /// Tokens available at rejection time
        available_tokens: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// The terminal state this decision represents.
    pub fn state(&self) -> EvaluationState {
        match self {
            Decision::Allowed { .. } => EvaluationState::Allowed,
            Decision::Throttled { .. } => EvaluationState::Throttled,
        }
    }
}

/// What to do when the bucket store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Propagate the store error; the request is not served
    #[default]
    FailClosed,
    /// Log the error and let the request through
    FailOpen,
}

/// The rate limiter engine.
///
/// Resolves the key and policy for a request, then consumes one token from
/// the shared store. Thread-safe; share it behind an `Arc`.
pub struct RateLimiter {
    registry: PolicyRegistry,
    routes: RouteTable,
    resolver: KeyResolver,
    store: Arc<dyn BucketStore>,
    fail_mode: FailMode,
}

impl RateLimiter {
    /// Create a limiter with the default key resolver, failing closed.
    pub fn new(registry: PolicyRegistry, routes: RouteTable, store: Arc<dyn BucketStore>) -> Self {
        Self {
            registry,
            routes,
            resolver: KeyResolver::new(),
            store,
            fail_mode: FailMode::default(),
        }
    }

    /// Use a custom key resolver.
    pub fn with_resolver(mut self, resolver: KeyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Choose the behavior on store failures.
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn fail_mode(&self) -> FailMode {
        self.fail_mode
    }

    /// Policy for a route: inline limit, then registry override, then default.
    pub fn resolve_policy(&self, spec: &RouteSpec) -> RateLimitPolicy {
        spec.limit.unwrap_or_else(|| self.registry.get_policy(&spec.route))
    }

    /// Replace the registry policy of a route at runtime.
    pub fn update_policy(
        &self,
        route: &str,
        capacity: u64,
        refill_tokens: u64,
        refill_period_secs: u64,
    ) -> Result<()> {
        if self.routes.get(route).and_then(|spec| spec.limit).is_some() {
            warn!(
                route = %route,
                "Route declares an inline limit; the registry policy will not apply to it"
            );
        }
        self.registry
            .update_policy(route, capacity, refill_tokens, refill_period_secs)
    }

    /// Evaluate a request against the limits of `route`.
    ///
    /// Consumes one token on every call; callers that may reach this more
    /// than once per request go through the gate, which evaluates once.
    pub async fn evaluate(&self, request: &dyn RequestAccessor, route: &str) -> Result<Decision> {
        trace!(route = %route, state = ?EvaluationState::NotEvaluated, "Evaluating request");

        let Some(spec) = self.routes.get(route) else {
            trace!(route = %route, state = ?EvaluationState::Allowed, "Route is not rate limited");
            return Ok(Decision::Allowed { remaining: None });
        };

        let key = self.resolver.resolve(request, &spec.keys);
        trace!(route = %route, key = %key, state = ?EvaluationState::KeyResolved, "Key resolved");

        let policy = self.resolve_policy(spec);
        let bucket_key = BucketKey::new(route, key);
        trace!(
            key = %bucket_key,
            policy = %policy,
            state = ?EvaluationState::BucketResolved,
            "Policy resolved"
        );

        let outcome = match self.store.consume(&bucket_key, &policy, 1).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return match self.fail_mode {
                    FailMode::FailClosed => Err(e),
                    FailMode::FailOpen => {
                        error!(
                            key = %bucket_key,
                            error = %e,
                            "Bucket store unavailable, allowing request"
                        );
                        Ok(Decision::Allowed { remaining: None })
                    }
                };
            }
        };

        if outcome.granted {
            trace!(
                key = %bucket_key,
                remaining = outcome.available_tokens,
                state = ?EvaluationState::Allowed,
                "Request allowed"
            );
            Ok(Decision::Allowed {
                remaining: Some(outcome.available_tokens),
            })
        } else {
            warn!(
                key = %bucket_key,
                available_tokens = outcome.available_tokens,
                capacity = policy.capacity,
                state = ?EvaluationState::Throttled,
                "Rate limit exceeded"
            );
            Ok(Decision::Throttled {
                key: bucket_key.key.to_string(),
                available_tokens: outcome.available_tokens,
            })
        }
    }

    /// Tokens currently available to a request on `route`, without consuming.
    ///
    /// Returns `None` for routes that are not rate limited.
    pub async fn available_tokens(
        &self,
        request: &dyn RequestAccessor,
        route: &str,
    ) -> Result<Option<u64>> {
        let Some(spec) = self.routes.get(route) else {
            return Ok(None);
        };
        let key = BucketKey::new(route, self.resolver.resolve(request, &spec.keys));
        let policy = self.resolve_policy(spec);
        let bucket = self.store.get_or_create(&key, &policy).await?;
        Ok(Some(bucket.available_tokens().await?))
    }
}
