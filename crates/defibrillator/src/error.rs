//! Error taxonomy for the GitHub access layer.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced to callers of the access layer.
///
/// Transient network faults and rate limits are recovered internally by the
/// executor's retry loop; the variants here are what remains once recovery
/// has run its course (or was never applicable).
#[derive(Debug, Error)]
pub enum Error {
    /// A token was required but none of the configured environment variables
    /// held one.
    #[error("GitHub token required but not found in environment variables: {sources:?}")]
    MissingCredential { sources: Vec<String> },

    /// Network faults or 5xx responses persisted past the retry ceiling.
    #[error("request failed after {attempts} attempts: {last}")]
    TransientExhausted { attempts: u32, last: String },

    /// Quota was exhausted and the mandated wait did not clear it.
    #[error("rate limit exceeded; resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// 401/403 not attributable to rate limiting.
    #[error("authentication rejected with status {status}")]
    Unauthorized { status: u16 },

    /// 4xx responses other than auth and rate-limit signals.
    #[error("GitHub API error {status} for {url}: {message}")]
    ClientError {
        status: u16,
        url: String,
        message: String,
    },

    /// A persisted cache or tracker snapshot was unreadable or malformed.
    ///
    /// Never surfaced from `execute` — corruption degrades to a cache miss
    /// and is logged; this variant exists for callers driving the persisted
    /// stores directly.
    #[error("cache entry unreadable: {reason}")]
    CacheCorruption { reason: String },
}

impl Error {
    /// Create a client error.
    #[inline]
    pub fn client(status: u16, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClientError {
            status,
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a cache corruption error.
    #[inline]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CacheCorruption {
            reason: reason.into(),
        }
    }

    /// Check if this error is a rate limit error.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Result type for access-layer operations.
pub type Result<T> = std::result::Result<T, Error>;
