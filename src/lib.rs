//! Ratekeeper - Adaptive Rate Limiting
//!
//! This crate implements per-operation request throttling with token buckets.
//! Each protected route is keyed by the client IP plus request attributes
//! (headers, path variables, JSON body fields), and buckets live either in
//! process memory or in a shared Redis store.

pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
