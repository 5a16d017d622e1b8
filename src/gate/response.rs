//! Response envelope for rejected requests.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RateKeeperError;

/// Status code of a rate limited response, and its `resp_code`.
pub const RATE_LIMIT_EXCEEDED_CODE: u16 = 429;
/// Message carried by a rate limited response.
pub const RATE_LIMIT_EXCEEDED_MESSAGE: &str = "Too many requests, rate limit exceeded";

/// The host application's generic response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub resp_code: i32,
    pub resp_msg: String,
    /// RFC 3339 timestamp, UTC
    pub datetime: String,
}

impl RejectionBody {
    pub fn new(resp_code: i32, resp_msg: impl Into<String>) -> Self {
        Self {
            resp_code,
            resp_msg: resp_msg.into(),
            datetime: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Body for a throttled request.
    pub fn rate_limit_exceeded() -> Self {
        Self::new(RATE_LIMIT_EXCEEDED_CODE as i32, RATE_LIMIT_EXCEEDED_MESSAGE)
    }

    /// Body for any limiter error, for hosts that render errors themselves.
    pub fn from_error(err: &RateKeeperError) -> Self {
        if err.is_rate_limited() {
            return Self::rate_limit_exceeded();
        }
        Self::new(err.status_code() as i32, err.to_string())
    }
}

/// A short-circuited request: status, body and what triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// HTTP-equivalent status, always 429
    pub status: u16,
    pub body: RejectionBody,
    /// The composite key that ran out of quota
    pub key: String,
    /// Tokens available when the request was rejected
    pub available_tokens: u64,
}

impl RateLimitRejection {
    pub fn new(key: impl Into<String>, available_tokens: u64) -> Self {
        Self {
            status: RATE_LIMIT_EXCEEDED_CODE,
            body: RejectionBody::rate_limit_exceeded(),
            key: key.into(),
            available_tokens,
        }
    }

    /// The body serialized as JSON.
    pub fn body_json(&self) -> String {
        // A struct of strings and integers always serializes
        serde_json::to_string(&self.body).unwrap_or_default()
    }

    /// Convert into the error form, for `?`-style propagation.
    pub fn into_error(self) -> RateKeeperError {
        RateKeeperError::RateLimitExceeded {
            key: self.key,
            available_tokens: self.available_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_body_shape() {
        let rejection = RateLimitRejection::new("1.2.3.4", 0);
        let json: serde_json::Value = serde_json::from_str(&rejection.body_json()).unwrap();

        assert_eq!(rejection.status, 429);
        assert_eq!(json["resp_code"], 429);
        assert_eq!(json["resp_msg"], RATE_LIMIT_EXCEEDED_MESSAGE);
        let datetime = json["datetime"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(datetime).is_ok());
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_body_from_errors() {
        let store = RateKeeperError::StoreUnavailable("down".into());
        let body = RejectionBody::from_error(&store);
        assert_eq!(body.resp_code, 503);
        assert!(body.resp_msg.contains("down"));

        let exceeded = RateLimitRejection::new("k", 0).into_error();
        assert_eq!(RejectionBody::from_error(&exceeded).resp_code, 429);
    }
}
