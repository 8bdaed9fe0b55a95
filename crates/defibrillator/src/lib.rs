//! defibrillator - rate-limit aware GitHub API access layer.
//!
//! A single façade over GitHub's REST surface for the surrounding tooling's
//! short-lived scripts: it authenticates requests, tracks and respects
//! primary and secondary rate limits, revalidates with ETags so unchanged
//! resources cost no bandwidth, follows `Link`-header pagination, and
//! retries transient failures with backoff. Payloads are never interpreted;
//! callers decode bodies into whatever shape their endpoint returns.
//!
//! # Example
//!
//! ```ignore
//! use defibrillator::{ClientConfig, GitHubClient, RequestSpec};
//!
//! let client = GitHubClient::new(ClientConfig::default())?;
//!
//! let repo: serde_json::Value = client
//!     .get_json(&RequestSpec::get("/repos/rust-lang/rust"))
//!     .await?;
//!
//! let mut pages = client.paginate(RequestSpec::get("/orgs/rust-lang/repos"));
//! while let Some(page) = pages.next_page::<serde_json::Value>().await? {
//!     println!("{} repos", page.items.len());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod http;
pub mod limits;
pub mod paginate;
pub mod request;
pub mod retry;

pub use cache::{CacheEntry, ConditionalCache};
pub use config::ClientConfig;
pub use credentials::{AuthMode, CredentialResolver};
pub use error::{Error, Result};
pub use executor::{Fetched, Freshness, GitHubClient};
pub use http::{HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport};
pub use limits::{ApiRateLimiter, RateLimitState, RateLimitTracker};
pub use paginate::{Page, Paginator};
pub use request::{CacheKey, RequestSpec, Resource};
pub use retry::{Outcome, RetryDecision, RetryPolicy};
