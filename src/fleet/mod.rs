//! The upstream SOCKS5 proxy fleet.
//!
//! This module covers the worker side of the gateway:
//! - fetching and parsing the remote proxy list
//! - bringing endpoints up into ready clients (probe-and-ready handshake)
//! - per-client spoofed headers and per-(proxy, host) admission control
//! - the upstream fetch with typed outcome classification

pub mod client;
pub mod headers;
pub mod limiter;
pub mod list;
pub mod manager;

pub use client::{FetchOutcome, ProxyClient};
pub use limiter::{GcraLimiter, RateLimitOutcome};
pub use list::{fetch_proxy_list, parse_proxy_list, ProxyEndpoint};
pub use manager::ProxyManager;
