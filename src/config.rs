//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.heimdall/config.toml` (user)
//! 3. `/etc/heimdall/config.toml` (system)
//!
//! The API token is loaded separately with a mandatory permission check:
//! 1. `~/.heimdall/secrets.toml` (must be 0600 or 0400)
//! 2. `SENSORTOWER_API_TOKEN` environment variable
//!
//! Quota thresholds and the pacing interval have no defaults. A config
//! file that omits them fails to load.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::DispatcherConfig;
use crate::quota::QuotaPolicy;
use crate::retry::RetryConfig;
use crate::transport::{DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::{HeimdallError, Result};

/// Environment variable consulted when no secrets file exists.
pub const TOKEN_ENV_VAR: &str = "SENSORTOWER_API_TOKEN";

/// Dispatcher configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    pub quota: QuotaConfig,
    pub pacing: PacingConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub ledger: LedgerSection,
}

/// Provider endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL (default: https://api.sensortower.com/v1).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-call timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

/// Monthly call thresholds. All three are required.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub warn_threshold: u64,
    pub hard_threshold: u64,
    pub block_threshold: u64,
}

/// Request pacing. Required.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    pub min_request_interval_ms: u64,
}

/// Retry settings for transient provider errors.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Response cache location and default TTL.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Cache directory (default: `<cache dir>/heimdall/responses`).
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// TTL used when a caller does not pick one (default: 168).
    #[serde(default = "default_ttl_hours")]
    pub default_ttl_hours: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: None,
            default_ttl_hours: default_ttl_hours(),
        }
    }
}

fn default_ttl_hours() -> u64 {
    168
}

/// Usage ledger location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerSection {
    /// Ledger file (default: `<cache dir>/heimdall/usage.jsonl`).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Root directory for cache and ledger when the config names neither.
pub fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("heimdall")
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.heimdall/config.toml`
    /// 3. `/etc/heimdall/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content).map_err(|e| match e {
            HeimdallError::Configuration(msg) => {
                HeimdallError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to parse config: {e}"))
        })?;
        config.quota_policy()?;
        Ok(config)
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(HeimdallError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".heimdall").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/heimdall/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(HeimdallError::Configuration(
            "No config file found. Create ~/.heimdall/config.toml or /etc/heimdall/config.toml"
                .to_string(),
        ))
    }

    pub fn quota_policy(&self) -> Result<QuotaPolicy> {
        QuotaPolicy::new(
            self.quota.warn_threshold,
            self.quota.hard_threshold,
            self.quota.block_threshold,
        )
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.timeout_secs)
    }

    /// Everything the dispatcher needs from this file.
    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        Ok(DispatcherConfig::new(
            self.quota_policy()?,
            Duration::from_millis(self.pacing.min_request_interval_ms),
        )
        .request_timeout(self.request_timeout())
        .retry(self.retry_config())
        .default_ttl(Duration::from_secs(
            self.cache.default_ttl_hours.saturating_mul(3600),
        )))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("responses"))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("usage.jsonl"))
    }
}

/// Provider credentials.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub sensortower: Option<ApiTokenSecret>,
}

/// A single API token.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiTokenSecret {
    pub api_token: String,
}

impl Secrets {
    /// Load secrets from `~/.heimdall/secrets.toml` with a permission check.
    ///
    /// Returns empty secrets if the file does not exist; the token may then
    /// come from [`TOKEN_ENV_VAR`].
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".heimdall").join("secrets.toml");
            if user_secrets.exists() {
                return Self::from_path(&user_secrets);
            }
        }
        Ok(Secrets::default())
    }

    /// Load a specific secrets file. Its permissions are checked first.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        // Reject if group or other bits are set
        if mode & 0o077 != 0 {
            return Err(HeimdallError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// API token from the secrets file, falling back to [`TOKEN_ENV_VAR`].
    pub fn api_token(&self) -> Option<String> {
        self.sensortower
            .as_ref()
            .map(|s| s.api_token.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| {
                std::env::var(TOKEN_ENV_VAR)
                    .ok()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
            })
    }
}
