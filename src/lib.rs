//! Heimdall - quota-governed, cache-first dispatcher for metered market-data APIs
//!
//! Every request to the provider goes through one [`Dispatcher`], which
//! serves fresh answers from a durable cache, refuses network calls once
//! the monthly quota is spent, paces the calls it does make and records
//! each one in a durable usage ledger.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use heimdall::endpoints::{self, ChartType, Platform};
//! use heimdall::{DispatcherConfig, Heimdall, QuotaPolicy};
//!
//! #[tokio::main]
//! async fn main() -> heimdall::Result<()> {
//!     let dispatcher = Heimdall::builder()
//!         .config(DispatcherConfig::new(
//!             QuotaPolicy::new(2000, 2500, 3000)?,
//!             Duration::from_secs(1),
//!         ))
//!         .cache_dir("/tmp/heimdall/responses")
//!         .ledger_path("/tmp/heimdall/usage.jsonl")
//!         .api_token("st-your-token")
//!         .build()
//!         .await?;
//!
//!     let request = endpoints::top_apps(Platform::Ios, "6014", ChartType::TopFree, None, "US");
//!     let ranking = dispatcher
//!         .fetch_request(&request, Duration::from_secs(168 * 3600), false)
//!         .await?;
//!
//!     println!("{ranking}");
//!     println!("calls this month: {}", dispatcher.monthly_usage(None).await);
//!     Ok(())
//! }
//! ```
//!
//! # From configuration files
//!
//! ```rust,no_run
//! use heimdall::config::{Config, Secrets};
//! use heimdall::DispatcherBuilder;
//!
//! # async fn run() -> heimdall::Result<()> {
//! let config = Config::load(None)?;
//! let dispatcher = DispatcherBuilder::from_config(&config, &Secrets::load()?)?
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod limiter;
pub mod quota;
pub mod request;
pub mod retry;
pub mod telemetry;
pub mod transport;
pub mod version;

// Re-export main types at crate root
pub use error::{ErrorKind, HeimdallError, Result};
pub use dispatcher::{DEFAULT_TTL, Dispatcher, DispatcherBuilder, DispatcherConfig, Heimdall};

pub use cache::{CacheEntry, CacheStore, FileCacheStore, MemoryCacheStore};
pub use fingerprint::{Fingerprint, Params};
pub use ledger::{CallOutcome, UsageLedger, UsageMonth, UsageRecord};
pub use limiter::RateLimiter;
pub use quota::{Decision, QuotaGuard, QuotaPolicy, QuotaSnapshot, QuotaStatus};
pub use request::FetchRequest;
pub use retry::RetryConfig;
pub use transport::{HttpTransport, Transport};
pub use version::{PKG_VERSION, version_string};
