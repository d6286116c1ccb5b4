//! Durable usage ledger.
//!
//! Every network call the dispatcher actually makes, successful or not,
//! is appended here as one [`UsageRecord`]. The ledger is the source of
//! truth for monthly quota accounting, so it errs on the side of counting:
//! failed attempts count against the month just like successful ones.
//!
//! # Storage
//!
//! JSON Lines, one record per line, appended and fsynced before
//! [`UsageLedger::record`] returns. On open, the file is replayed into an
//! in-memory index (records plus per-month counts). A line that fails to
//! parse, typically a torn write from a crash, is skipped with a warning.
//! Each append first terminates any such fragment, so a later record is
//! never merged into it.

use std::collections::BTreeMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::fingerprint::Fingerprint;
use crate::{HeimdallError, Result};

/// Outcome of one network call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl CallOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatched network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub fingerprint: Fingerprint,
    pub outcome: CallOutcome,
}

impl UsageRecord {
    /// A record stamped with the current time.
    pub fn now(endpoint: impl Into<String>, fingerprint: Fingerprint, outcome: CallOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            fingerprint,
            outcome,
        }
    }

    pub fn month(&self) -> UsageMonth {
        UsageMonth::of(self.timestamp)
    }
}

/// A calendar month in UTC, formatted `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageMonth {
    year: i32,
    month: u32,
}

impl UsageMonth {
    /// Returns `None` unless `month` is 1..=12.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(timestamp: DateTime<Utc>) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for UsageMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for UsageMonth {
    type Err = HeimdallError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HeimdallError::InvalidInput(format!("invalid month '{s}', expected YYYY-MM"));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

/// In-memory index rebuilt from the file on open.
#[derive(Default)]
struct LedgerState {
    records: Vec<UsageRecord>,
    monthly: BTreeMap<UsageMonth, u64>,
}

impl LedgerState {
    fn push(&mut self, record: UsageRecord) {
        *self.monthly.entry(record.month()).or_default() += 1;
        self.records.push(record);
    }
}

/// Append-only record of network calls with monthly aggregation.
///
/// Appends are serialized by a single lock, so concurrent callers can
/// never interleave partial lines. Reads share the lock and are cheap.
pub struct UsageLedger {
    path: Option<PathBuf>,
    state: RwLock<LedgerState>,
}

impl UsageLedger {
    /// Open (creating if needed) a ledger file and replay its history.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HeimdallError::Storage(format!(
                    "failed to create ledger dir {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let state = Self::replay(&path).await?;
        info!(
            path = %path.display(),
            records = state.records.len(),
            "opened usage ledger"
        );
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(LedgerState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Rebuild the index from disk.
    async fn replay(path: &Path) -> Result<LedgerState> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerState::default());
            }
            Err(e) => {
                return Err(HeimdallError::Storage(format!(
                    "failed to read ledger {}: {e}",
                    path.display()
                )));
            }
        };

        let mut state = LedgerState::default();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => state.push(record),
                Err(e) => warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unreadable ledger line"
                ),
            }
        }
        Ok(state)
    }

    /// Durably append a record.
    ///
    /// The line is written and fsynced before the in-memory index is
    /// updated, so a record that is counted has always reached disk.
    pub async fn record(&self, record: UsageRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(path) = &self.path {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            Self::append_line(path, line).await?;
        }
        state.push(record);
        Ok(())
    }

    /// Append one serialized line.
    ///
    /// If the file does not end in a newline (a torn write from a crash or
    /// an earlier failed append), the fragment is terminated first so the
    /// new line stays parseable on its own.
    async fn append_line(path: &Path, mut line: Vec<u8>) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                HeimdallError::Storage(format!("failed to open ledger {}: {e}", path.display()))
            })?;

        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "terminating torn ledger line before append");
                line.insert(0, b'\n');
            }
        }

        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Number of attempts recorded in `month`, whatever their outcome.
    pub async fn monthly_usage(&self, month: UsageMonth) -> u64 {
        self.state
            .read()
            .await
            .monthly
            .get(&month)
            .copied()
            .unwrap_or(0)
    }

    /// The last `n` records, most recent first.
    pub async fn recent(&self, n: usize) -> Vec<UsageRecord> {
        self.state
            .read()
            .await
            .records
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    /// Usage per month for every month with at least one record.
    pub async fn monthly_history(&self) -> BTreeMap<UsageMonth, u64> {
        self.state.read().await.monthly.clone()
    }

    /// Timestamp of the newest record, if any.
    pub async fn last_call_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .await
            .records
            .iter()
            .map(|r| r.timestamp)
            .max()
    }

    /// Total number of records.
    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
