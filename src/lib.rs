//! Edgeguard - rate limiting for abuse-sensitive HTTP endpoints
//!
//! This crate counts requests per bucket and caller identity and rejects
//! callers that exceed a bucket's limit with a structured 429. Counters live
//! either in a shared networked store reached over REST or, when none is
//! configured, in process memory.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
