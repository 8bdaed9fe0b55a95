//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::DEFAULT_MAX_AGE;
use crate::credentials::AuthMode;

/// Default on-disk cache location, relative to the working directory.
/// Surrounding tooling usually overrides this with a state-directory path.
pub const DEFAULT_CACHE_PATH: &str = ".cache/defibrillator/github_cache.json";

/// Settings for [`GitHubClient`](crate::GitHubClient), each overridable.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root. Default `https://api.github.com`.
    pub base_url: String,
    /// User-Agent attached to every request.
    pub user_agent: String,
    /// Explicit token; wins over the environment lookup when set.
    pub token: Option<String>,
    /// Environment variables consulted for a token, in order.
    pub token_env: Vec<String>,
    /// How strictly a token is required.
    pub auth: AuthMode,
    /// Wall-clock timeout per transport dispatch. Default 30 s — bounded
    /// and well under the retry loop's cumulative wait.
    pub timeout: Duration,
    /// Transient retries before giving up. Default 6.
    pub max_retries: u32,
    /// First backoff delay. Default 1 s.
    pub backoff_base: Duration,
    /// Backoff cap. Default 60 s.
    pub backoff_max: Duration,
    /// Quota headroom kept in reserve per resource. Default 1.
    pub safety_margin: u32,
    /// Optional fixed requests-per-second pacing across all resources.
    pub requests_per_second: Option<u32>,
    /// Conditional-cache file; `None` keeps the cache in memory only.
    pub cache_path: Option<PathBuf>,
    /// Age past which persisted cache entries are dropped. Default 7 days.
    pub cache_max_age: Duration,
    /// Optional file persisting the rate-limit tracker between runs.
    pub tracker_snapshot_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            user_agent: "IroncladSalvage/defibrillator".to_string(),
            token: None,
            token_env: vec!["GITHUB_TOKEN".to_string(), "GH_TOKEN".to_string()],
            auth: AuthMode::Auto,
            timeout: Duration::from_secs(30),
            max_retries: 6,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            safety_margin: 1,
            requests_per_second: None,
            cache_path: Some(PathBuf::from(DEFAULT_CACHE_PATH)),
            cache_max_age: DEFAULT_MAX_AGE,
            tracker_snapshot_path: None,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration, max_retries: u32) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_safety_margin(mut self, margin: u32) -> Self {
        self.safety_margin = margin;
        self
    }

    #[must_use]
    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = Some(rps);
        self
    }

    /// Set the cache file, or disable persistence with `None`.
    #[must_use]
    pub fn with_cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.cache_path = path;
        self
    }

    #[must_use]
    pub fn with_tracker_snapshot_path(mut self, path: Option<PathBuf>) -> Self {
        self.tracker_snapshot_path = path;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "https://api.github.com");
        assert_eq!(config.token_env, vec!["GITHUB_TOKEN", "GH_TOKEN"]);
        assert_eq!(config.auth, AuthMode::Auto);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 6);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(60));
        assert_eq!(config.safety_margin, 1);
        assert!(config.requests_per_second.is_none());
        assert_eq!(config.cache_path, Some(PathBuf::from(DEFAULT_CACHE_PATH)));
        assert!(config.tracker_snapshot_path.is_none());
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = ClientConfig::default()
            .with_base_url("http://localhost:8080")
            .with_auth(AuthMode::None)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(50), 2)
            .with_safety_margin(10)
            .with_cache_path(None);
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.auth, AuthMode::None);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.safety_margin, 10);
        assert!(config.cache_path.is_none());
    }
}
