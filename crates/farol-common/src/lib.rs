//! Farol Common - Shared foundation for the Farol crates
//!
//! This crate provides what every other Farol component leans on:
//! - The error taxonomy (`FarolError`) and `Result` alias
//! - Typed configuration loading with periodic file reload
//! - Tracing setup for binaries and tests
//! - The shutdown signal and the coordinator that merges OS termination
//!   with caller-held cancellation

pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;

// Re-exports for convenience
pub use config::{DirectoryConfig, Meta};
pub use error::{FarolError, Result};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

use std::time::Duration;

/// Default TTL for registration leases.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// Default renewal cadence. Strictly less than the TTL so a single missed
/// cycle cannot expire the lease.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for outbound dials.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on shutdown-path directory calls, so process exit cannot hang
/// on a wedged coordination store.
pub const SHUTDOWN_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout toward the coordination store, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
