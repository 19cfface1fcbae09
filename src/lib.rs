//! Reflex Agent: Endpoint Agent Runtime
//!
//! Pairs an installation with a management console, reports liveness, runs
//! pluggable roles on a schedule and keeps every outbound action in a durable
//! queue until the console acknowledges it.

pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod pairing;
pub mod queue;
pub mod retry;
pub mod role;
pub mod runtime;
pub mod tooling;
pub mod types;

pub use error::AgentError;

/// Version string reported in heartbeats and the User-Agent header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
