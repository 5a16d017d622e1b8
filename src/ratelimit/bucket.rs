//! Token bucket implementation.

use std::time::Instant;

use super::policy::RateLimitPolicy;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A token bucket with continuous (greedy) refill.
///
/// Tokens accrue in proportion to elapsed time, `refill_tokens` per
/// `refill_period`, and never exceed `capacity`. The bucket itself is not
/// synchronized; stores wrap it in a lock so every access is atomic.
///
/// Token counts are fixed-point: one token is `refill_period` in nanoseconds
/// worth of units, and every elapsed nanosecond credits exactly
/// `refill_tokens` units. Refill is therefore exact integer arithmetic and
/// polling a bucket often never loses a fraction of a token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// The bandwidth this bucket enforces
    policy: RateLimitPolicy,
    /// Current tokens in units, always within `0..=capacity` tokens
    units: u128,
    /// When tokens were last credited
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        Self {
            policy,
            units: capacity_units(&policy),
            last_refill: now,
        }
    }

    /// Refill, then take `tokens` if that many are available.
    ///
    /// Returns `true` on success. On failure nothing is taken.
    pub fn try_consume(&mut self, tokens: u64, now: Instant) -> bool {
        self.refill(now);

        let requested = (tokens as u128).saturating_mul(units_per_token(&self.policy));
        if self.units >= requested {
            self.units -= requested;
            true
        } else {
            false
        }
    }

    /// Whole tokens available after refill.
    pub fn available_tokens(&mut self, now: Instant) -> u64 {
        self.refill(now);
        let whole = self.units / units_per_token(&self.policy);
        u64::try_from(whole).unwrap_or(u64::MAX).min(self.policy.capacity)
    }

    /// Replace the bandwidth, keeping accrued tokens up to the new capacity.
    pub fn reconfigure(&mut self, policy: RateLimitPolicy, now: Instant) {
        self.refill(now);

        let old_unit = units_per_token(&self.policy);
        let new_unit = units_per_token(&policy);
        if old_unit != new_unit {
            let whole = self.units / old_unit;
            let fraction = self.units % old_unit;
            self.units = whole
                .saturating_mul(new_unit)
                .saturating_add(fraction.saturating_mul(new_unit) / old_unit);
        }
        self.policy = policy;
        self.units = self.units.min(capacity_units(&policy));
    }

    /// The bandwidth this bucket enforces.
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn refill(&mut self, now: Instant) {
        // A clock that moved backwards credits nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let added = elapsed
            .as_nanos()
            .saturating_mul(self.policy.refill_tokens as u128);
        self.units = self
            .units
            .saturating_add(added)
            .min(capacity_units(&self.policy));
        self.last_refill = now;
    }
}

fn units_per_token(policy: &RateLimitPolicy) -> u128 {
    (policy.refill_period_secs as u128).saturating_mul(NANOS_PER_SEC)
}

fn capacity_units(policy: &RateLimitPolicy) -> u128 {
    (policy.capacity as u128).saturating_mul(units_per_token(policy))
}
