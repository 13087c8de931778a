//! HTTP adapter built on axum.

mod identity;
mod middleware;
mod server;

pub use middleware::{
    client_ip, protect, rate_limit_middleware, rejection_response, request_info, CallerIdentity,
    RateLimitState,
};
pub use identity::{
    identity_middleware, lift_identity, IdentityHeaders, SUBJECT_HEADER, TIER_HEADER,
};
pub use server::{health_router, HttpServer};
