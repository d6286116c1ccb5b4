//! Durable cache backend: one JSON document per fingerprint.
//!
//! Layout: `<dir>/<fingerprint>.json`. Writes go to a uniquely named
//! temp file in the same directory and are renamed into place, so a
//! reader never observes a half-written entry and concurrent writers to
//! distinct fingerprints never touch the same path.
//!
//! Reads are fronted by a bounded moka layer holding recently read or
//! written entries. The layer is a pure accelerator: it is populated only
//! from successful reads and writes and invalidated by `prune`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheStore, prune_cutoff};
use crate::fingerprint::Fingerprint;
use crate::request::FetchRequest;
use crate::telemetry;
use crate::{HeimdallError, Result};

/// Default number of entries kept in the in-process read layer.
const DEFAULT_HOT_ENTRIES: u64 = 1_000;

/// Extension of committed entries.
const ENTRY_EXT: &str = "json";

/// Extension of in-flight writes.
const TMP_EXT: &str = "tmp";

/// File-backed [`CacheStore`].
pub struct FileCacheStore {
    dir: PathBuf,
    hot: Cache<Fingerprint, Arc<CacheEntry>>,
    tmp_seq: AtomicU64,
}

impl FileCacheStore {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_hot_entries(dir, DEFAULT_HOT_ENTRIES)
    }

    /// Open with a custom read-layer capacity (0 disables the layer).
    pub fn with_hot_entries(dir: impl Into<PathBuf>, hot_entries: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            HeimdallError::Storage(format!("failed to create cache dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            hot: Cache::new(hot_entries),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}.{ENTRY_EXT}", fingerprint.as_str()))
    }

    fn tmp_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.{}.{seq}.{TMP_EXT}",
            fingerprint.as_str(),
            std::process::id()
        ))
    }

    /// Read and validate the entry file for `fingerprint`.
    async fn read_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        let content = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(HeimdallError::CacheCorrupted {
                    key: fingerprint.to_string(),
                    reason: format!("unreadable {}: {e}", path.display()),
                });
            }
        };
        let entry: CacheEntry =
            serde_json::from_slice(&content).map_err(|e| HeimdallError::CacheCorrupted {
                key: fingerprint.to_string(),
                reason: format!("malformed {}: {e}", path.display()),
            })?;
        if &entry.fingerprint != fingerprint {
            return Err(HeimdallError::CacheCorrupted {
                key: fingerprint.to_string(),
                reason: format!("file holds entry for {}", entry.fingerprint),
            });
        }
        Ok(Some(entry))
    }

    /// Timestamp used to decide whether a file is prunable.
    ///
    /// Falls back to the file's mtime when the entry cannot be parsed, so
    /// corrupt files still age out.
    async fn file_fetched_at(path: &Path) -> Option<DateTime<Utc>> {
        if let Ok(content) = tokio::fs::read(path).await
            && let Ok(entry) = serde_json::from_slice::<CacheEntry>(&content)
        {
            return Some(entry.fetched_at);
        }
        let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if let Some(entry) = self.hot.get(fingerprint) {
            return Some((*entry).clone());
        }
        match self.read_entry(fingerprint).await {
            Ok(Some(entry)) => {
                self.hot.insert(fingerprint.clone(), Arc::new(entry.clone()));
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                metrics::counter!(telemetry::CACHE_CORRUPTIONS_TOTAL).increment(1);
                warn!(
                    fingerprint = fingerprint.short(),
                    error = %e,
                    "ignoring unreadable cache entry"
                );
                None
            }
        }
    }

    async fn put(
        &self,
        request: &FetchRequest,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry::new(request, payload, ttl);
        let fingerprint = &entry.fingerprint;
        let json = serde_json::to_vec_pretty(&entry)?;

        let tmp_path = self.tmp_path(fingerprint);
        let path = self.entry_path(fingerprint);
        if let Err(e) = tokio::fs::write(&tmp_path, &json).await {
            return Err(HeimdallError::Storage(format!(
                "failed to write cache file {}: {e}",
                tmp_path.display()
            )));
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(HeimdallError::Storage(format!(
                "failed to rename cache file {} → {}: {e}",
                tmp_path.display(),
                path.display()
            )));
        }

        self.hot.insert(fingerprint.clone(), Arc::new(entry.clone()));
        debug!(
            fingerprint = fingerprint.short(),
            endpoint = %entry.endpoint,
            "cached response"
        );
        Ok(entry)
    }

    async fn prune(&self, older_than: Duration) -> Result<usize> {
        let cutoff = prune_cutoff(older_than);
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            HeimdallError::Storage(format!(
                "failed to list cache dir {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut removed = 0;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let Some(fetched_at) = Self::file_fetched_at(&path).await else {
                continue;
            };
            if fetched_at >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to prune cache file");
                    continue;
                }
            }
            if let Some(fingerprint) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(Fingerprint::from_hex)
            {
                self.hot.invalidate(&fingerprint);
            }
        }

        info!(removed, dir = %self.dir.display(), "pruned cache");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::fingerprint::Params;

    fn request() -> FetchRequest {
        FetchRequest::new("ios/apps", Params::new().with("app_ids", "284882215"))
    }

    #[tokio::test]
    async fn entry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let req = request();
        {
            let store = FileCacheStore::open(dir.path()).unwrap();
            store
                .put(&req, serde_json::json!({"apps": []}), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let reopened = FileCacheStore::open(dir.path()).unwrap();
        let entry = reopened.get(req.fingerprint()).await.unwrap();
        assert_eq!(entry.payload, serde_json::json!({"apps": []}));
        assert_eq!(entry.params.get("app_ids"), Some("284882215"));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        store
            .put(&request(), serde_json::json!(1), Duration::ZERO)
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::with_hot_entries(dir.path(), 0).unwrap();
        let req = request();
        std::fs::write(store.entry_path(req.fingerprint()), "{ not json").unwrap();

        assert!(store.get(req.fingerprint()).await.is_none());
    }

    #[tokio::test]
    async fn mismatched_fingerprint_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::with_hot_entries(dir.path(), 0).unwrap();
        let other = FetchRequest::new("android/apps", Params::new());
        let entry = CacheEntry::new(&other, serde_json::json!(1), Duration::ZERO);

        let req = request();
        std::fs::write(
            store.entry_path(req.fingerprint()),
            serde_json::to_vec(&entry).unwrap(),
        )
        .unwrap();

        assert!(store.get(req.fingerprint()).await.is_none());
    }

    #[tokio::test]
    async fn prune_deletes_old_entries_and_invalidates_hot_layer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        let req = request();
        let old = CacheEntry {
            fetched_at: Utc::now() - TimeDelta::days(31),
            ..CacheEntry::new(&req, serde_json::json!("old"), Duration::ZERO)
        };
        std::fs::write(
            store.entry_path(req.fingerprint()),
            serde_json::to_vec(&old).unwrap(),
        )
        .unwrap();
        // Warm the read layer.
        assert!(store.get(req.fingerprint()).await.is_some());

        let fresh = FetchRequest::new("ios/apps", Params::new().with("app_ids", "1"));
        store
            .put(&fresh, serde_json::json!("fresh"), Duration::ZERO)
            .await
            .unwrap();

        let removed = store.prune(Duration::from_secs(30 * 24 * 3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(req.fingerprint()).await.is_none());
        assert!(store.get(fresh.fingerprint()).await.is_some());
    }

    #[tokio::test]
    async fn prune_removes_corrupt_files_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        std::fs::write(store.entry_path(request().fingerprint()), "garbage").unwrap();

        // Zero retention: anything written before now is prunable.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = store.prune(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
    }
}
