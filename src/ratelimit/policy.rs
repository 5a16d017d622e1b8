//! Rate limit policies and the registry that resolves them per route.
//!
//! A policy is the bandwidth of one token bucket: how many tokens it holds and
//! how fast they come back. The registry carries one default policy plus
//! per-route overrides, and supports replacing an override at runtime.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{RateKeeperError, Result};

/// Bandwidth of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
    /// Tokens added back per refill period
    pub refill_tokens: u64,
    /// Length of the refill period in seconds
    pub refill_period_secs: u64,
}

impl RateLimitPolicy {
    /// Create a validated policy.
    pub fn new(capacity: u64, refill_tokens: u64, refill_period_secs: u64) -> Result<Self> {
        let policy = Self {
            capacity,
            refill_tokens,
            refill_period_secs,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that every field is at least 1.
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(RateKeeperError::InvalidPolicy(format!(
                "capacity must be >= 1, got {}",
                self.capacity
            )));
        }
        if self.refill_tokens < 1 {
            return Err(RateKeeperError::InvalidPolicy(format!(
                "refill_tokens must be >= 1, got {}",
                self.refill_tokens
            )));
        }
        if self.refill_period_secs < 1 {
            return Err(RateKeeperError::InvalidPolicy(format!(
                "refill_period_secs must be >= 1, got {}",
                self.refill_period_secs
            )));
        }
        Ok(())
    }

    /// The refill period as a duration.
    pub fn refill_period(&self) -> Duration {
        Duration::from_secs(self.refill_period_secs)
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tokens, +{} every {}s",
            self.capacity, self.refill_tokens, self.refill_period_secs
        )
    }
}

/// Default policy and per-route overrides.
///
/// Overrides are stored as `Arc`s and replaced wholesale, so a reader either
/// sees the previous policy or the new one.
pub struct PolicyRegistry {
    default: RateLimitPolicy,
    overrides: RwLock<HashMap<String, Arc<RateLimitPolicy>>>,
}

impl PolicyRegistry {
    /// Create a registry with only a default policy.
    pub fn new(default: RateLimitPolicy) -> Result<Self> {
        default.validate()?;
        Ok(Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        })
    }

    /// Create a registry from a default policy and a map of route overrides.
    pub fn with_overrides(
        default: RateLimitPolicy,
        overrides: HashMap<String, RateLimitPolicy>,
    ) -> Result<Self> {
        let registry = Self::new(default)?;
        {
            let mut map = registry.overrides.write();
            for (route, policy) in overrides {
                policy.validate().map_err(|e| {
                    RateKeeperError::InvalidPolicy(format!("route {}: {}", route, e))
                })?;
                map.insert(route, Arc::new(policy));
            }
        }
        Ok(registry)
    }

    /// The default policy.
    pub fn default_policy(&self) -> RateLimitPolicy {
        self.default
    }

    /// Get the policy for a route, falling back to the default.
    pub fn get_policy(&self, route_id: &str) -> RateLimitPolicy {
        self.overrides
            .read()
            .get(route_id)
            .map(|p| **p)
            .unwrap_or(self.default)
    }

    /// Validate and install a new policy for a route.
    pub fn update_policy(
        &self,
        route_id: &str,
        capacity: u64,
        refill_tokens: u64,
        refill_period_secs: u64,
    ) -> Result<()> {
        let policy = RateLimitPolicy::new(capacity, refill_tokens, refill_period_secs)?;
        let previous = self
            .overrides
            .write()
            .insert(route_id.to_string(), Arc::new(policy));

        info!(
            route = %route_id,
            policy = %policy,
            previous = ?previous.map(|p| *p),
            "Rate limit policy updated"
        );
        Ok(())
    }

    /// Drop the override for a route. Returns whether one existed.
    pub fn remove_override(&self, route_id: &str) -> bool {
        let removed = self.overrides.write().remove(route_id).is_some();
        if removed {
            info!(route = %route_id, "Rate limit policy override removed");
        }
        removed
    }

    /// Snapshot of all overrides, sorted by route.
    pub fn overrides(&self) -> Vec<(String, RateLimitPolicy)> {
        let mut entries: Vec<(String, RateLimitPolicy)> = self
            .overrides
            .read()
            .iter()
            .map(|(route, policy)| (route.clone(), **policy))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
