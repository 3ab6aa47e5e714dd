//! Client connector
//!
//! [`Cli`] dials either a fixed target address or, in discovery mode, the
//! next address in the resolver's round-robin rotation. Dials block up to an
//! explicit timeout, and a post-connect hook initializes typed protocol
//! clients bound to the established channel.

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use farol_common::{FarolError, Result, DEFAULT_DIAL_TIMEOUT};

use crate::resolver::Resolver;

type InitClientFn = Arc<dyn Fn(Channel) + Send + Sync>;

/// gRPC client bootstrap.
pub struct Cli {
    name: String,
    target: Option<String>,
    discovery: Option<Arc<Resolver>>,
    init_client: Option<InitClientFn>,
    dial_timeout: Duration,
}

impl Cli {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            discovery: None,
            init_client: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Dial this address directly, bypassing discovery.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Pick addresses round robin from a live resolver.
    pub fn with_discovery(mut self, resolver: Arc<Resolver>) -> Self {
        self.discovery = Some(resolver);
        self
    }

    /// Hook run after each successful dial, for building typed protocol
    /// clients on the established channel.
    pub fn with_init_client(mut self, f: impl Fn(Channel) + Send + Sync + 'static) -> Self {
        self.init_client = Some(Arc::new(f));
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Establish a connection within the dial timeout.
    pub async fn dial(&self) -> Result<Channel> {
        let address = match (&self.target, &self.discovery) {
            (Some(target), _) => target.clone(),
            (None, Some(resolver)) => resolver.next()?,
            (None, None) => {
                return Err(FarolError::Config(format!(
                    "client '{}' has neither a target nor discovery",
                    self.name
                )));
            }
        };
        debug!(client = %self.name, %address, "dialing");

        let uri = if address.contains("://") {
            address.clone()
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| FarolError::Config(format!("bad dial target '{address}': {e}")))?
            .connect_timeout(self.dial_timeout);

        let channel = tokio::time::timeout(self.dial_timeout, endpoint.connect())
            .await
            .map_err(|_| {
                FarolError::Connectivity(format!(
                    "dial '{address}' timed out after {:?}",
                    self.dial_timeout
                ))
            })?
            .map_err(|e| FarolError::Connectivity(format!("dial '{address}' failed: {e}")))?;

        info!(client = %self.name, %address, "connected");
        if let Some(init) = &self.init_client {
            init(channel.clone());
        }
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_without_target_or_discovery_is_config_error() {
        let cli = Cli::new("user-srv");
        assert!(matches!(cli.dial().await, Err(FarolError::Config(_))));
    }

    #[tokio::test]
    async fn test_dial_bad_target_is_config_error() {
        let cli = Cli::new("user-srv").with_target("not a uri");
        assert!(matches!(cli.dial().await, Err(FarolError::Config(_))));
    }

    #[tokio::test]
    async fn test_dial_unreachable_is_connectivity_error() {
        // non-routable address: fails by refusal or by the dial timeout
        let cli = Cli::new("user-srv")
            .with_target("10.255.255.1:1")
            .with_dial_timeout(Duration::from_millis(200));
        assert!(matches!(
            cli.dial().await,
            Err(FarolError::Connectivity(_))
        ));
    }
}
