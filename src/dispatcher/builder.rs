//! Builder for configuring dispatcher instances

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{Dispatcher, DispatcherConfig};
use crate::cache::{CacheStore, FileCacheStore};
use crate::config::{Config, Secrets, TOKEN_ENV_VAR};
use crate::ledger::UsageLedger;
use crate::limiter::RateLimiter;
use crate::transport::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT, HttpTransport, Transport};
use crate::{HeimdallError, Result};

/// Main entry point for creating dispatcher instances.
pub struct Heimdall;

impl Heimdall {
    /// Create a new builder for configuring the dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }
}

/// Builder for configuring dispatcher instances.
///
/// Every piece is explicit: a dispatcher config, a cache, a ledger and a
/// transport must each be provided, either as a ready instance or as the
/// location/credential to open one from.
#[derive(Default)]
pub struct DispatcherBuilder {
    config: Option<DispatcherConfig>,
    cache: Option<Arc<dyn CacheStore>>,
    cache_dir: Option<PathBuf>,
    ledger: Option<Arc<UsageLedger>>,
    ledger_path: Option<PathBuf>,
    transport: Option<Arc<dyn Transport>>,
    api_token: Option<String>,
    base_url: Option<String>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded config file and secrets.
    ///
    /// Fails if the secrets carry no token and `SENSORTOWER_API_TOKEN`
    /// is unset.
    pub fn from_config(config: &Config, secrets: &Secrets) -> Result<Self> {
        let api_token = secrets.api_token().ok_or_else(|| {
            HeimdallError::Configuration(format!(
                "No API token. Add [sensortower] api_token to ~/.heimdall/secrets.toml \
                 or set {TOKEN_ENV_VAR}"
            ))
        })?;
        Ok(Self::new()
            .config(config.dispatcher_config()?)
            .cache_dir(config.cache_dir())
            .ledger_path(config.ledger_path())
            .base_url(config.provider.base_url.clone())
            .api_token(api_token))
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing cache store.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Open a [`FileCacheStore`] in `dir` at build time.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Use an existing ledger.
    pub fn ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Open the ledger file at `path` at build time.
    pub fn ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = Some(path.into());
        self
    }

    /// Use a custom transport. Takes precedence over [`api_token`](Self::api_token).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build an [`HttpTransport`] with this bearer token.
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Override the provider base URL used with [`api_token`](Self::api_token).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Open stores and assemble the dispatcher.
    ///
    /// The rate limiter is seeded from the ledger's newest record, so a
    /// restarted process still honours the pacing interval.
    pub async fn build(self) -> Result<Dispatcher> {
        let config = self.config.ok_or_else(|| {
            HeimdallError::Configuration("No dispatcher config provided".to_string())
        })?;

        let cache: Arc<dyn CacheStore> = match (self.cache, self.cache_dir) {
            (Some(cache), _) => cache,
            (None, Some(dir)) => Arc::new(FileCacheStore::open(dir)?),
            (None, None) => {
                return Err(HeimdallError::Configuration(
                    "No cache configured. Call .cache() or .cache_dir()".to_string(),
                ));
            }
        };

        let ledger = match (self.ledger, self.ledger_path) {
            (Some(ledger), _) => ledger,
            (None, Some(path)) => Arc::new(UsageLedger::open(path).await?),
            (None, None) => {
                return Err(HeimdallError::Configuration(
                    "No usage ledger configured. Call .ledger() or .ledger_path()".to_string(),
                ));
            }
        };

        let transport: Arc<dyn Transport> = match (self.transport, self.api_token) {
            (Some(transport), _) => transport,
            (None, Some(token)) => Arc::new(HttpTransport::with_base_url(
                token,
                self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
                // The dispatcher bounds each call; the client timeout is a backstop.
                config.request_timeout.max(DEFAULT_TIMEOUT) + Duration::from_secs(1),
            )?),
            (None, None) => {
                return Err(HeimdallError::Configuration(
                    "No transport configured. Call .api_token() or .transport()".to_string(),
                ));
            }
        };

        let limiter = RateLimiter::seeded(config.min_request_interval, ledger.last_call_at().await);

        Ok(Dispatcher::new(cache, ledger, limiter, transport, config))
    }
}
