//! Error types shared across the Farol crates

/// Error type for registration and discovery operations.
///
/// Construction-time failures (initial connect, initial register) surface
/// through these variants synchronously. Background-task failures (periodic
/// renewal, the diagnostics endpoint) are logged and retried instead.
#[derive(Debug, thiserror::Error)]
pub enum FarolError {
    /// Missing or invalid configuration. Fatal, surfaced at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The coordination store is unreachable or failed its health probe.
    #[error("directory connectivity error: {0}")]
    Connectivity(String),

    /// Lease create, renew, or revoke failure.
    #[error("lease error: {0}")]
    Lease(String),

    /// Directory entry write or delete failure.
    #[error("registration error: {0}")]
    Registration(String),

    /// The watch stream is unrecoverable; dependent connectors must fail
    /// outbound calls rather than serve a stale address set.
    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, FarolError>;
