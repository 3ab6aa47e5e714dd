//! Configuration loading for Farol components
//!
//! A `Meta` value is constructed once at process start and passed by
//! reference to whatever needs it; there is no ambient global lookup. The
//! schema is additive: new fields are optional with serde defaults, so old
//! configuration files keep loading.

use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{FarolError, Result};
use crate::shutdown::ShutdownSignal;
use crate::DEFAULT_CONNECT_TIMEOUT_MS;

/// Connection settings for the coordination store.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Coordination-store endpoints, e.g. `["http://127.0.0.1:2379"]`.
    pub endpoints: Vec<String>,
    pub connect_timeout_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl DirectoryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Process configuration, loaded from a file plus `FAROL`-prefixed
/// environment overrides.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Meta {
    pub directory: DirectoryConfig,
}

impl Meta {
    /// Load and validate configuration from `path` (YAML/TOML/JSON by
    /// extension). Environment variables such as
    /// `FAROL_DIRECTORY__ENDPOINTS=http://a:2379,http://b:2379` override
    /// file values.
    pub fn load(path: &str) -> Result<Meta> {
        let source = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                Environment::with_prefix("FAROL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("directory.endpoints"),
            )
            .build()
            .map_err(|e| FarolError::Config(format!("failed to read '{path}': {e}")))?;

        let meta: Meta = source
            .try_deserialize()
            .map_err(|e| FarolError::Config(format!("failed to parse '{path}': {e}")))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Startup validation. An empty endpoint list is fatal: nothing
    /// downstream can work without the directory.
    pub fn validate(&self) -> Result<()> {
        if self.directory.endpoints.is_empty() {
            return Err(FarolError::Config(
                "no directory endpoints configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load `path` once, then re-read it every `interval`, publishing snapshots
/// over a watch channel. Parse failures are logged and the last good
/// snapshot stays current. The task exits on `shutdown`.
pub fn spawn_reload(
    path: impl Into<String>,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> Result<(watch::Receiver<Arc<Meta>>, JoinHandle<()>)> {
    let path = path.into();
    let initial = Meta::load(&path)?;
    let (tx, rx) = watch::channel(Arc::new(initial));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => match Meta::load(&path) {
                    Ok(meta) => {
                        if tx.borrow().as_ref() != &meta {
                            debug!(%path, "configuration changed, publishing");
                            let _ = tx.send(Arc::new(meta));
                        }
                    }
                    Err(e) => warn!(%path, "configuration reload failed: {e}"),
                },
            }
        }
    });

    Ok((rx, handle))
}
