//! Request pipeline integration.

mod response;
mod service;

pub use response::{
    RateLimitRejection, RejectionBody, RATE_LIMIT_EXCEEDED_CODE, RATE_LIMIT_EXCEEDED_MESSAGE,
};
pub use service::{Gate, GateAction};
