//! Non-durable cache backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;

use super::{CacheEntry, CacheStore, prune_cutoff};
use crate::Result;
use crate::fingerprint::Fingerprint;
use crate::request::FetchRequest;

/// In-memory [`CacheStore`] backed by moka.
///
/// The moka cache is built without a capacity, TTL or idle timeout, so it
/// never evicts: [`prune`](CacheStore::prune) is the only deletion path,
/// as for the durable backend.
pub struct MemoryCacheStore {
    entries: Cache<Fingerprint, Arc<CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().build(),
        }
    }

    /// Insert a pre-built entry, keeping its `fetched_at`.
    ///
    /// Lets tests and importers seed the store with entries of a known age.
    pub fn insert_entry(&self, entry: CacheEntry) {
        self.entries
            .insert(entry.fingerprint.clone(), Arc::new(entry));
    }

    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.get(fingerprint).map(|e| (*e).clone())
    }

    async fn put(
        &self,
        request: &FetchRequest,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry::new(request, payload, ttl);
        self.insert_entry(entry.clone());
        Ok(entry)
    }

    async fn prune(&self, older_than: Duration) -> Result<usize> {
        let cutoff = prune_cutoff(older_than);
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.fetched_at < cutoff)
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &expired {
            self.entries.invalidate(key);
        }
        Ok(expired.len())
    }
}
