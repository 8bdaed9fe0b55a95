//! Configuration file support for the defib CLI.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. Environment variables (prefixed with `DEFIB_`, e.g., `DEFIB_GITHUB_TOKEN`)
//! 2. Local config file (./defibrillator.toml)
//! 3. XDG config file (~/.config/defibrillator/config.toml)
//! 4. Built-in defaults
//!
//! Example config file:
//! ```toml
//! [github]
//! token = "ghp_..."          # or use DEFIB_GITHUB_TOKEN env var
//! base_url = "https://api.github.com"
//!
//! [cache]
//! enabled = true
//! max_age_days = 7
//! # path = "/tmp/github_cache.json"   # default: XDG state dir
//!
//! [retry]
//! max_retries = 6
//! backoff_base_ms = 1000
//! backoff_max_ms = 60000
//! timeout_s = 30
//!
//! [limits]
//! safety_margin = 1
//! persist_state = true
//! # requests_per_second = 10
//! ```

use std::path::PathBuf;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use defibrillator::ClientConfig;
use directories::ProjectDirs;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GitHub connection settings.
    pub github: GitHubConfig,
    /// Conditional cache settings.
    pub cache: CacheConfig,
    /// Retry and timeout settings.
    pub retry: RetryConfig,
    /// Rate-limit settings.
    pub limits: LimitsConfig,
}

/// GitHub connection settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token.
    /// Can also be set via the DEFIB_GITHUB_TOKEN environment variable,
    /// or left unset to fall back to GITHUB_TOKEN / GH_TOKEN.
    pub token: Option<String>,
    /// API root, for GitHub Enterprise instances.
    pub base_url: Option<String>,
}

/// Conditional cache settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether to persist responses at all.
    pub enabled: bool,
    /// Cache file location. Defaults to the XDG state directory.
    pub path: Option<PathBuf>,
    /// Drop persisted entries older than this many days.
    pub max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_age_days: 7,
        }
    }
}

/// Retry and timeout settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Transient retries before giving up.
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff cap in milliseconds.
    pub backoff_max_ms: u64,
    /// Per-dispatch timeout in seconds.
    pub timeout_s: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            timeout_s: 30,
        }
    }
}

/// Rate-limit settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Quota headroom kept in reserve per resource.
    pub safety_margin: u32,
    /// Optional fixed requests-per-second pacing.
    pub requests_per_second: Option<u32>,
    /// Persist the tracker between invocations.
    pub persist_state: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            safety_margin: 1,
            requests_per_second: None,
            persist_state: true,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/defibrillator/config.toml)
    /// 3. Local config file (./defibrillator.toml)
    /// 4. Environment variables with DEFIB_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(proj_dirs) = ProjectDirs::from("", "", "defibrillator") {
            let xdg_config = proj_dirs.config_dir().join("config.toml");
            if xdg_config.exists() {
                tracing::debug!("Loading config from {:?}", xdg_config);
                builder = builder.add_source(
                    File::from(xdg_config)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        let local_config = PathBuf::from("defibrillator.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./defibrillator.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., DEFIB_GITHUB_TOKEN -> github.token
        builder = builder.add_source(
            Environment::with_prefix("DEFIB")
                .separator("_")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Assemble the access-layer configuration from the loaded settings.
    pub fn client_config(&self) -> ClientConfig {
        let mut cc = ClientConfig::default();

        if let Some(base_url) = &self.github.base_url {
            cc.base_url = base_url.clone();
        }
        if let Some(token) = &self.github.token {
            cc = cc.with_token(token.clone());
        }

        cc.timeout = Duration::from_secs(self.retry.timeout_s);
        cc = cc.with_backoff(
            Duration::from_millis(self.retry.backoff_base_ms),
            Duration::from_millis(self.retry.backoff_max_ms),
            self.retry.max_retries,
        );

        cc.safety_margin = self.limits.safety_margin;
        cc.requests_per_second = self.limits.requests_per_second;

        cc.cache_max_age = Duration::from_secs(self.cache.max_age_days * 24 * 60 * 60);
        cc.cache_path = if self.cache.enabled {
            self.cache
                .path
                .clone()
                .or_else(|| Self::default_state_dir().map(|dir| dir.join("github_cache.json")))
        } else {
            None
        };

        cc.tracker_snapshot_path = if self.limits.persist_state {
            Self::default_state_dir().map(|dir| dir.join("rate_limits.json"))
        } else {
            None
        };

        cc
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/defibrillator` or
    /// `~/.local/state/defibrillator`. On macOS/Windows, falls back to the
    /// data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "defibrillator").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}
