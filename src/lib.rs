//! loafer - a per-network caching DNS stub resolver.
//!
//! One process answers name-resolution queries for many logically isolated
//! networks. Each network carries its own upstream server set, search
//! domains, response cache, server reliability statistics and optional
//! DNS-over-TLS configuration; lookups pick their transport at runtime based
//! on which upstreams have proven reachable and, for DoT, validated.
//!
//! The interesting machinery:
//!
//! - [`cache`]: per-network response caching with deduplication of
//!   concurrent identical lookups.
//! - [`stats`]: a sliding-window reliability estimator deciding which
//!   upstreams to use and when to retry expired ones.
//! - [`dot`]: the DoT stack; an asynchronous TLS query multiplexer with a
//!   16-bit transaction-id pool, pipelined in-flight queries, reconnection
//!   with bounded retries and TLS session resumption.
//! - [`private_dns`]: per-network DoT modes and probe-based validation of
//!   candidate servers.
//!
//! [`cache_registry::ResolverRegistry`] ties it together and exposes the
//! per-network configuration surface; `main.rs` wraps it in a small UDP
//! front-end.

pub mod address;
pub mod cache;
pub mod cache_registry;
pub mod config;
pub mod dot;
pub mod message;
pub mod net;
pub mod params;
pub mod prefix64;
pub mod private_dns;
pub mod resolver;
pub mod server;
pub mod stats;
pub mod telemetry;
pub mod tls;
