//! Runtime configuration for the store, the auto-save scheduler and the quota monitor.
//!
//! Every struct deserializes from JSON with per-field defaults so FFI hosts only need to
//! send the values they want to override.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MAP_SIZE_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_READERS: u32 = 126;

const DEFAULT_DEBOUNCE_MS: u64 = 1000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_MS: u64 = 8000;

const DEFAULT_THRESHOLD_BYTES: u64 = 200 * 1024 * 1024;
const DEFAULT_RETAINED_DEPTH: usize = 50;
const DEFAULT_WORKING_COPY_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

/// Where and how the LMDB environment is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Directory holding the LMDB environment. Created on open.
    pub path: PathBuf,
    /// Upper bound of the memory map. Writes past it fail with `QuotaExceeded`.
    pub map_size_bytes: usize,
    pub max_readers: u32,
}

impl StoreConfig {
    /// `<name>.lmdb` in the current directory.
    pub fn named(name: &str) -> Self {
        Self {
            path: PathBuf::from(format!("{name}.lmdb")),
            ..Self::default()
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("apd_store.lmdb"),
            map_size_bytes: DEFAULT_MAP_SIZE_BYTES,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoSaveConfig {
    pub debounce_ms: u64,
    /// Retries after the first failed attempt, transient errors only.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl AutoSaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionPolicy {
    /// Cleanup runs once estimated usage reaches this many bytes.
    pub threshold_bytes: u64,
    /// Newest versions kept per document, counted by sequence.
    pub retained_depth: usize,
    pub working_copy_retention_secs: u64,
}

impl RetentionPolicy {
    pub fn working_copy_retention(&self) -> chrono::Duration {
        let secs = i64::try_from(self.working_copy_retention_secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            retained_depth: DEFAULT_RETAINED_DEPTH,
            working_copy_retention_secs: DEFAULT_WORKING_COPY_RETENTION_SECS,
        }
    }
}
