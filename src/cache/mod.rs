//! Response cache.
//!
//! [`CacheStore`] is the key/value contract the dispatcher talks to. Two
//! backends ship with the crate:
//!
//! - [`FileCacheStore`]: durable, one JSON document per fingerprint, with
//!   an in-process read layer for hot entries.
//! - [`MemoryCacheStore`]: non-durable, for tests and throwaway sessions.
//!
//! # Freshness vs. retention
//!
//! Entries carry the TTL they were written with, but freshness is always
//! judged against the TTL of the *reading* call, so a caller can demand a
//! fresher view of data cached with a longer TTL. Stale entries are never
//! deleted implicitly; [`CacheStore::prune`] is the only deletion path.

pub mod file;
pub mod memory;

pub use file::FileCacheStore;
pub use memory::MemoryCacheStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::fingerprint::{Fingerprint, Params};
use crate::request::FetchRequest;

/// A cached provider response.
///
/// Created once per successful network call and never edited; a refetch
/// replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub endpoint: String,
    pub params: Params,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub payload: serde_json::Value,
}

impl CacheEntry {
    /// Build an entry for `request` stamped with the current time.
    pub fn new(request: &FetchRequest, payload: serde_json::Value, ttl: Duration) -> Self {
        Self {
            fingerprint: request.fingerprint().clone(),
            endpoint: request.endpoint().to_string(),
            params: request.params().clone(),
            fetched_at: Utc::now(),
            ttl,
            payload,
        }
    }

    /// Age of the entry at `now`. Negative ages (clock skew) clamp to zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.fetched_at)
            .max(TimeDelta::zero())
    }

    /// `now - fetched_at <= ttl`.
    pub fn is_fresh_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match TimeDelta::from_std(ttl) {
            Ok(ttl) => self.age_at(now) <= ttl,
            // TTL too large to represent: nothing can be older than it.
            Err(_) => true,
        }
    }
}

/// Cutoff timestamp for a prune: entries fetched before it are removed.
pub(crate) fn prune_cutoff(older_than: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(older_than)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Durable key/value store for provider responses, keyed by fingerprint.
///
/// Implementations must tolerate concurrent writers to distinct
/// fingerprints. Concurrent writers to the same fingerprint may race;
/// the last write wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Look up the entry for a fingerprint.
    ///
    /// Missing and unreadable entries both return `None`; corruption is
    /// logged by the backend rather than surfaced.
    async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry>;

    /// Create or overwrite the entry for `request` with `fetched_at = now`.
    async fn put(
        &self,
        request: &FetchRequest,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Result<CacheEntry>;

    /// Delete entries fetched more than `older_than` ago. Returns the
    /// number of entries removed.
    async fn prune(&self, older_than: Duration) -> Result<usize>;

    /// Whether `entry` is still fresh under the caller's `ttl`.
    fn is_fresh(&self, entry: &CacheEntry, ttl: Duration) -> bool {
        entry.is_fresh_at(ttl, Utc::now())
    }
}
