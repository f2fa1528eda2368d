//! Napgate - An idle-aware reverse proxy for Docker containers
//!
//! This library provides a reverse proxy that:
//! - Forwards HTTP traffic to a fixed upstream, keyed on the Host header
//! - Discovers containers declaring a VIRTUAL_HOST environment variable
//! - Tracks container lifecycle via the Docker event stream
//! - Stops containers that have seen no traffic for a configurable threshold
//! - Lazily restarts a stopped container when a request for its host arrives
//! - Uses connection pooling for efficient upstream communication

pub mod config;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod runtime;
pub mod sync;
