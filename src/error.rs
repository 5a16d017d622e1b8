//! Error types for Ratekeeper.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RateKeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy failed validation (capacity, tokens or period below 1)
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// The shared bucket store could not be reached or answered garbage
    #[error("Bucket store unavailable: {0}")]
    StoreUnavailable(String),

    /// The request ran out of quota for its key
    #[error("Rate limit exceeded for key {key} ({available_tokens} tokens available)")]
    RateLimitExceeded {
        key: String,
        available_tokens: u64,
    },
}

impl RateKeeperError {
    /// HTTP-equivalent status for hosts that surface this error directly.
    pub fn status_code(&self) -> u16 {
        match self {
            RateKeeperError::RateLimitExceeded { .. } => 429,
            RateKeeperError::StoreUnavailable(_) => 503,
            RateKeeperError::Config(_) | RateKeeperError::InvalidPolicy(_) => 500,
        }
    }

    /// Whether this is the expected over-quota outcome rather than a failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RateKeeperError::RateLimitExceeded { .. })
    }
}

impl From<config::ConfigError> for RateKeeperError {
    fn from(err: config::ConfigError) -> Self {
        RateKeeperError::Config(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for RateKeeperError {
    fn from(err: redis::RedisError) -> Self {
        RateKeeperError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RateKeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let exceeded = RateKeeperError::RateLimitExceeded {
            key: "1.2.3.4".to_string(),
            available_tokens: 0,
        };
        assert_eq!(exceeded.status_code(), 429);
        assert!(exceeded.is_rate_limited());

        let store = RateKeeperError::StoreUnavailable("connection refused".to_string());
        assert_eq!(store.status_code(), 503);
        assert!(!store.is_rate_limited());

        assert_eq!(RateKeeperError::InvalidPolicy("capacity".into()).status_code(), 500);
        assert_eq!(RateKeeperError::Config("missing".into()).status_code(), 500);
    }
}
