//! Conditional response cache keyed by [`CacheKey`].
//!
//! One entry per key, overwritten whole on every successful non-304 fetch.
//! The on-disk form is a single JSON map, replaced atomically on save, so a
//! write either fully lands or leaves the previous file intact. Unreadable
//! or malformed files degrade to an empty cache: corruption is never fatal
//! and never visible to `execute` callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::HttpHeaders;
use crate::limits::write_json_atomic;
use crate::request::CacheKey;

/// Cache entries older than this are dropped at load time.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A cached response: the ETag to revalidate with and the body to serve on
/// a 304.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub etag: String,
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: String,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(etag: impl Into<String>, status: u16, headers: HttpHeaders, body: impl Into<String>) -> Self {
        Self {
            etag: etag.into(),
            status,
            headers,
            body: body.into(),
            stored_at: Utc::now(),
        }
    }
}

/// Persistent key→entry store backing conditional requests.
#[derive(Debug)]
pub struct ConditionalCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Per-key critical sections: the executor holds a key's lock from ETag
    /// snapshot through cache store, so two callers on one key serialize
    /// while distinct keys never contend.
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    path: Option<PathBuf>,
}

impl ConditionalCache {
    /// A cache that lives only for the process's lifetime.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// A cache backed by a JSON file, seeded from its current contents.
    ///
    /// Entries older than `max_age` are dropped at load. A missing file is
    /// an empty cache; an unreadable one is logged and treated the same.
    #[must_use]
    pub fn with_file(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        let path = path.into();
        let entries = match load_entries(&path, max_age) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), "cache unreadable, starting empty: {e}");
                HashMap::new()
            }
        };
        Self {
            entries: Mutex::new(entries),
            key_locks: Mutex::new(HashMap::new()),
            path: Some(path),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up the entry for `key`, if present.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock_entries().get(key.as_str()).cloned()
    }

    /// Unconditionally replace the entry for `key`.
    ///
    /// A failed disk write is logged and swallowed: the fetched result is
    /// still good, the cache is just cold for this key next run.
    pub fn store(&self, key: &CacheKey, entry: CacheEntry) {
        let _ = self.lock_entries().insert(key.as_str().to_string(), entry);
        if let Err(e) = self.save() {
            tracing::warn!(key = %key, "failed to persist cache: {e}");
        }
    }

    /// Explicitly drop the entry for `key` (forced refresh).
    ///
    /// Returns whether an entry existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.lock_entries().remove(key.as_str()).is_some();
        if removed
            && let Err(e) = self.save()
        {
            tracing::warn!(key = %key, "failed to persist cache: {e}");
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock_entries().clear();
        if let Err(e) = self.save() {
            tracing::warn!("failed to persist cache: {e}");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// The async mutex serializing executor calls for `key`.
    #[must_use]
    pub(crate) fn key_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(key.as_str().to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.lock_entries().clone();
        write_json_atomic(path, &snapshot)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_entries(path: &Path, max_age: Duration) -> Result<HashMap<String, CacheEntry>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| Error::corrupt(e.to_string()))?;
    let mut entries: HashMap<String, CacheEntry> =
        serde_json::from_str(&raw).map_err(|e| Error::corrupt(e.to_string()))?;

    let cutoff = Utc::now()
        - chrono::TimeDelta::from_std(max_age).unwrap_or(chrono::TimeDelta::MAX);
    entries.retain(|_, entry| entry.stored_at > cutoff);
    Ok(entries)
}
