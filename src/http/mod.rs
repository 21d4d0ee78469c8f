//! HTTP surface: the rate limit middleware and the server hosting it.

mod layer;
mod response;
mod server;

pub use layer::{RateLimitLayer, RateLimitService};
pub use response::{
    apply_rate_limit_headers, too_many_requests, RATELIMIT_BACKEND, RATELIMIT_LIMIT,
    RATELIMIT_REMAINING, RATELIMIT_RESET,
};
pub use server::HttpServer;
