//! A multiplexing IPTV reverse proxy for Ace Stream engines.
//!
//! Any number of HTTP clients can watch the same content through a single
//! upstream engine connection. Transient upstream failures are absorbed by a
//! per-stream ring buffer and a reconnection loop; chronic failures trip a
//! circuit breaker. A session allocator hands reconnecting players a stable
//! PID so the engine sees one session instead of a churn of new ones.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod sessions;
pub mod streaming;
pub mod web;
