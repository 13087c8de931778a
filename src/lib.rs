//! Ratewarden - Admission Control for HTTP APIs
//!
//! This crate implements fixed-window rate limiting with burst detection and
//! escalating penalties for repeat offenders. Counters live in a shared
//! key-value backend when one is available and in process memory otherwise;
//! storage trouble never blocks a request.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
pub mod tier;
