//! Process-wide rate-limit accounting.
//!
//! GitHub's limit headers are authoritative but only arrive after a call
//! completes. The tracker bridges that gap: it optimistically decrements a
//! local estimate when a call is dispatched and overwrites the whole state
//! whenever a response reports the server's numbers. Concurrent callers can
//! overshoot by at most the number of in-flight requests.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};

use crate::http::{HttpHeaders, header_get};
use crate::request::Resource;

/// Last-known quota window for one rate-limit resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackerInner {
    states: HashMap<Resource, RateLimitState>,
    /// Secondary-limit deadlines: retry not before this instant, independent
    /// of how much quota the window claims to have left.
    penalties: HashMap<Resource, DateTime<Utc>>,
}

/// Shared tracker of remaining quota per API resource.
///
/// Constructed once and passed by handle into every executor call; tests
/// substitute fresh instances per case. All operations take `&self` and are
/// atomic with respect to each other.
#[derive(Debug)]
pub struct RateLimitTracker {
    inner: Mutex<TrackerInner>,
    safety_margin: u32,
    snapshot_path: Option<PathBuf>,
}

impl RateLimitTracker {
    /// Create a tracker that keeps `safety_margin` units of headroom before
    /// throttling (at least 1, so a hard block is never tripped).
    #[must_use]
    pub fn new(safety_margin: u32) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::default()),
            safety_margin: safety_margin.max(1),
            snapshot_path: None,
        }
    }

    /// Persist the tracker to `path` after every authoritative update, and
    /// seed it from an existing snapshot so short-lived invocations inherit
    /// the last-known state.
    #[must_use]
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.inner = Mutex::new(load_snapshot(&path));
        self.snapshot_path = Some(path);
        self
    }

    /// How long to wait before dispatching a call against `resource`.
    ///
    /// Zero while headroom remains above the safety margin and no secondary
    /// deadline is pending; otherwise the duration until the later of the
    /// quota reset and the secondary deadline. Deadlines already in the past
    /// cost nothing.
    #[must_use]
    pub fn reserve(&self, resource: Resource) -> Duration {
        let now = Utc::now();
        let inner = self.lock();
        let mut wait = Duration::ZERO;

        if let Some(state) = inner.states.get(&resource)
            && state.remaining <= self.safety_margin
            && state.reset_at > now
        {
            wait = until(now, state.reset_at);
        }

        if let Some(deadline) = inner.penalties.get(&resource)
            && *deadline > now
        {
            wait = wait.max(until(now, *deadline));
        }

        wait
    }

    /// Optimistically consume one unit of headroom for `resource`.
    ///
    /// Called after `reserve` returns zero and before the call is
    /// dispatched, so concurrent callers see reduced headroom without
    /// waiting for the response round-trip. A no-op until the first
    /// `observe` creates state for the resource.
    pub fn decrement_optimistic(&self, resource: Resource) {
        let mut inner = self.lock();
        if let Some(state) = inner.states.get_mut(&resource) {
            state.remaining = state.remaining.saturating_sub(1);
        }
    }

    /// Authoritative update from a response's limit headers.
    ///
    /// Server truth always overwrites local bookkeeping.
    pub fn observe(&self, resource: Resource, limit: u32, remaining: u32, reset_at: DateTime<Utc>) {
        {
            let mut inner = self.lock();
            let _ = inner.states.insert(
                resource,
                RateLimitState {
                    limit,
                    remaining,
                    reset_at,
                },
            );
        }
        self.save_snapshot();
    }

    /// Record a secondary (abuse) limit deadline for `resource`.
    ///
    /// `reserve` honors whichever deadline is later, so an earlier signal is
    /// never shortened by a later, milder one.
    pub fn record_secondary(&self, resource: Resource, retry_at: DateTime<Utc>) {
        {
            let mut inner = self.lock();
            let deadline = inner.penalties.entry(resource).or_insert(retry_at);
            if retry_at > *deadline {
                *deadline = retry_at;
            }
        }
        tracing::debug!(
            resource = resource.as_str(),
            retry_at = %retry_at,
            "secondary rate limit recorded"
        );
        self.save_snapshot();
    }

    /// Last-known state for `resource`, if any response has reported one.
    #[must_use]
    pub fn state(&self, resource: Resource) -> Option<RateLimitState> {
        self.lock().states.get(&resource).cloned()
    }

    /// Write the current state to the configured snapshot path.
    pub fn persist(&self) -> std::io::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = self.lock().clone();
        write_json_atomic(path, &snapshot)
    }

    fn save_snapshot(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!("failed to persist rate-limit snapshot: {e}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

fn load_snapshot(path: &Path) -> TrackerInner {
    if !path.exists() {
        return TrackerInner::default();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!(path = %path.display(), "rate-limit snapshot malformed, starting fresh: {e}");
                TrackerInner::default()
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), "rate-limit snapshot unreadable, starting fresh: {e}");
            TrackerInner::default()
        }
    }
}

/// Serialize `value` to `path` via a temp file + rename, so a crash mid-write
/// never leaves a half-written file behind.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(value).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Extract `(limit, remaining, reset_at)` from GitHub response headers.
#[must_use]
pub fn parse_rate_limit_headers(headers: &HttpHeaders) -> Option<(u32, u32, DateTime<Utc>)> {
    let limit = header_get(headers, "x-ratelimit-limit")?.parse::<u32>().ok()?;
    let remaining = header_get(headers, "x-ratelimit-remaining")?
        .parse::<u32>()
        .ok()?;
    let reset_epoch = header_get(headers, "x-ratelimit-reset")?
        .parse::<i64>()
        .ok()?;
    let reset_at = DateTime::from_timestamp(reset_epoch, 0)?;
    Some((limit, remaining, reset_at))
}

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A fixed requests-per-second pacer using the governor crate.
///
/// Independent of the quota tracker: the tracker keeps the client inside
/// GitHub's published windows, the pacer spreads bursts out so concurrent
/// fan-out is less likely to trip the abuse detector in the first place.
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
}

impl ApiRateLimiter {
    /// Create a pacer allowing `requests_per_second` dispatches (minimum 1).
    #[must_use]
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Wait until the pacer allows another dispatch.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}
