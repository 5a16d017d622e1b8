//! The rate limit gate, invoked once per inbound request.

use std::sync::Arc;
use tracing::{debug, instrument};

use super::response::RateLimitRejection;
use crate::error::Result;
use crate::ratelimit::{Decision, RateLimiter, RequestAccessor};

/// What the request pipeline should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    /// Forward the request to business logic unmodified
    Continue,
    /// Short-circuit with a rate limit rejection
    Reject(RateLimitRejection),
}

/// Pipeline stage wrapping the rate limiter.
///
/// The decision is stored on the request's evaluation marker, so the gate
/// may sit at several points of a pipeline (router level and handler level)
/// and still consume a single token per request.
#[derive(Clone)]
pub struct Gate {
    limiter: Arc<RateLimiter>,
}

impl Gate {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide whether the request to `route` may proceed.
    ///
    /// Store failures are returned as errors, never as a rejection.
    #[instrument(skip_all, fields(route = %route))]
    pub async fn check<R: RequestAccessor>(&self, request: &R, route: &str) -> Result<GateAction> {
        let marker = request.evaluation();
        if marker.is_evaluated() {
            debug!("Request already evaluated, reusing decision");
        }

        let decision = marker
            .cell()
            .get_or_try_init(|| self.limiter.evaluate(request, route))
            .await?;

        Ok(match decision {
            Decision::Allowed { .. } => GateAction::Continue,
            Decision::Throttled {
                key,
                available_tokens,
            } => GateAction::Reject(RateLimitRejection::new(key.clone(), *available_tokens)),
        })
    }

    /// Like [`Gate::check`], but a rejection becomes
    /// `RateKeeperError::RateLimitExceeded`.
    pub async fn enforce<R: RequestAccessor>(&self, request: &R, route: &str) -> Result<()> {
        match self.check(request, route).await? {
            GateAction::Continue => Ok(()),
            GateAction::Reject(rejection) => Err(rejection.into_error()),
        }
    }

    /// Administrative policy update, applied without restart.
    pub fn update_policy(
        &self,
        route: &str,
        capacity: u64,
        refill_tokens: u64,
        refill_period_secs: u64,
    ) -> Result<()> {
        self.limiter
            .update_policy(route, capacity, refill_tokens, refill_period_secs)
    }
}
