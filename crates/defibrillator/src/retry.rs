//! Outcome classification and retry decisions.
//!
//! Retry control flow is an explicit state machine: the executor keeps the
//! attempt counters, classifies each failure into an [`Outcome`], and asks
//! the pure [`RetryPolicy::decide`] what to do. The only suspension points
//! are the waits the decision mandates.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::Error;
use crate::http::{HttpHeaders, header_get};
use crate::limits::parse_rate_limit_headers;

/// Longest wait a rate-limit deadline may impose. A reset epoch computed
/// against a skewed clock must not strand a run for an hour.
pub const MAX_LIMIT_WAIT: Duration = Duration::from_secs(300);

/// Fallback secondary-limit cooldown when the server names no deadline.
const SECONDARY_COOLDOWN: Duration = Duration::from_secs(60);

/// Classified result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 5xx, timeout, connection reset — worth retrying with backoff.
    Transient { detail: String },
    /// Primary quota exhausted; safe again once the window resets.
    PrimaryLimit { reset_at: DateTime<Utc> },
    /// Secondary (abuse) limit; safe again at the server-named deadline.
    SecondaryLimit { retry_at: DateTime<Utc> },
    /// 401/403 not attributable to rate limiting.
    AuthRejected { status: u16 },
    /// Other 4xx — the request itself is wrong; retrying cannot help.
    Client {
        status: u16,
        url: String,
        message: String,
    },
}

/// What to do after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Wait this long, then dispatch again.
    RetryAfter(Duration),
    /// Give up with the classified error.
    Fail(Error),
}

/// Backoff parameters, pure with respect to [`decide`](RetryPolicy::decide)
/// apart from jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first transient retry; doubles per attempt.
    pub base_delay: Duration,
    /// Cap on the computed (pre-jitter) delay.
    pub max_delay: Duration,
    /// Transient retries allowed before giving up.
    pub max_attempts: u32,
    /// Whether to add random jitter of up to the computed delay.
    pub with_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 6,
            with_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom backoff bounds and attempt ceiling.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            with_jitter: true,
        }
    }

    /// Set whether to use jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.with_jitter = jitter;
        self
    }

    /// Decide what to do after attempt number `attempt` (zero-based count of
    /// failures of this outcome's kind so far) ended in `outcome`.
    ///
    /// Transient outcomes back off exponentially up to the attempt ceiling.
    /// Rate-limit outcomes retry exactly once, after waiting out the
    /// deadline the server reported — the server has said exactly when it
    /// is safe, so the backoff curve does not apply. Auth and client
    /// outcomes fail immediately.
    #[must_use]
    pub fn decide(&self, attempt: u32, outcome: &Outcome, now: DateTime<Utc>) -> RetryDecision {
        match outcome {
            Outcome::Transient { detail } => {
                if attempt < self.max_attempts {
                    RetryDecision::RetryAfter(self.backoff_delay(attempt))
                } else {
                    RetryDecision::Fail(Error::TransientExhausted {
                        attempts: attempt + 1,
                        last: detail.clone(),
                    })
                }
            }
            Outcome::PrimaryLimit { reset_at } => {
                if attempt == 0 {
                    RetryDecision::RetryAfter(limit_wait(now, *reset_at))
                } else {
                    RetryDecision::Fail(Error::RateLimited {
                        reset_at: *reset_at,
                    })
                }
            }
            Outcome::SecondaryLimit { retry_at } => {
                if attempt == 0 {
                    RetryDecision::RetryAfter(limit_wait(now, *retry_at))
                } else {
                    RetryDecision::Fail(Error::RateLimited {
                        reset_at: *retry_at,
                    })
                }
            }
            Outcome::AuthRejected { status } => {
                RetryDecision::Fail(Error::Unauthorized { status: *status })
            }
            Outcome::Client {
                status,
                url,
                message,
            } => RetryDecision::Fail(Error::client(*status, url.clone(), message.clone())),
        }
    }

    /// Exponential backoff: base doubling per attempt, capped, with jitter
    /// of up to the same magnitude as the computed delay.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.with_jitter {
            delay + delay.mul_f64(fastrand::f64())
        } else {
            delay
        }
    }
}

fn limit_wait(now: DateTime<Utc>, deadline: DateTime<Utc>) -> Duration {
    (deadline - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_LIMIT_WAIT)
}

/// Classify a non-success response into an [`Outcome`].
///
/// Rate-limit signals hide among 403s: primary exhaustion is a 403/429 with
/// `X-RateLimit-Remaining: 0`, the secondary limit announces itself in the
/// body message or via `Retry-After` with quota still left. Everything else
/// under 403 is an auth failure.
#[must_use]
pub fn classify(url: &str, status: u16, headers: &HttpHeaders, body: &[u8], now: DateTime<Utc>) -> Outcome {
    if status >= 500 {
        return Outcome::Transient {
            detail: format!("HTTP {status} from {url}"),
        };
    }

    if status == 403 || status == 429 {
        let remaining_zero = header_get(headers, "x-ratelimit-remaining") == Some("0");
        let retry_after = parse_retry_after(headers);
        let message = body_message(body);

        if message.contains("secondary rate limit") {
            let retry_at = now + delta(retry_after.unwrap_or(SECONDARY_COOLDOWN));
            return Outcome::SecondaryLimit { retry_at };
        }
        if remaining_zero {
            // Retry-After wins over the reset epoch; the reset gets one
            // extra second so the new window has actually opened.
            let reset_at = retry_after.map(|d| now + delta(d)).or_else(|| {
                parse_rate_limit_headers(headers).map(|(_, _, reset)| reset + TimeDelta::seconds(1))
            });
            return Outcome::PrimaryLimit {
                reset_at: reset_at.unwrap_or(now + delta(SECONDARY_COOLDOWN)),
            };
        }
        if status == 429 || retry_after.is_some() || message.contains("rate limit") {
            let retry_at = now + delta(retry_after.unwrap_or(SECONDARY_COOLDOWN));
            return Outcome::SecondaryLimit { retry_at };
        }
        return Outcome::AuthRejected { status };
    }

    if status == 401 {
        return Outcome::AuthRejected { status };
    }

    if (400..500).contains(&status) {
        return Outcome::Client {
            status,
            url: url.to_string(),
            message: truncate(&String::from_utf8_lossy(body), 200),
        };
    }

    Outcome::Transient {
        detail: format!("unexpected HTTP {status} from {url}"),
    }
}

/// Parse a numeric `Retry-After` header into a duration.
#[must_use]
pub fn parse_retry_after(headers: &HttpHeaders) -> Option<Duration> {
    header_get(headers, "retry-after")?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn body_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_lowercase))
        .unwrap_or_default()
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}
