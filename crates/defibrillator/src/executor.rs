//! The request executor: one logical call through the full pipeline.
//!
//! Per call: derive the cache key and snapshot the cached ETag, reserve
//! quota (sleeping out any pre-emptive throttle), optimistically decrement,
//! dispatch, fold the response's limit headers back into the tracker, then
//! either return data (storing fresh entries, serving cached bodies on 304)
//! or loop per the retry policy's decision.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::cache::{CacheEntry, ConditionalCache};
use crate::config::ClientConfig;
use crate::credentials::CredentialResolver;
use crate::error::{Error, Result};
use crate::http::{
    HttpHeaders, HttpMethod, HttpRequest, HttpTransport, ReqwestTransport, header_get,
};
use crate::limits::{ApiRateLimiter, RateLimitTracker, parse_rate_limit_headers};
use crate::paginate::Paginator;
use crate::request::{CacheKey, RequestSpec};
use crate::retry::{Outcome, RetryDecision, RetryPolicy, classify};

/// Whether a result came back from cache (304) or was freshly fetched (200).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Cached,
}

/// The envelope of one executed call.
///
/// The layer never interprets the payload; callers decode it into whatever
/// shape the endpoint returns via [`Fetched::json`].
#[derive(Debug, Clone)]
pub struct Fetched {
    pub url: String,
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: String,
    pub freshness: Freshness,
}

impl Fetched {
    /// Decode the body into a caller-specified shape.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.freshness == Freshness::Cached
    }
}

/// GitHub API client: the single façade consumer scripts call into.
///
/// Cheap to clone; clones share the tracker, cache, and transport, which is
/// how concurrent fan-out stays inside one quota budget.
#[derive(Clone)]
pub struct GitHubClient {
    transport: Arc<dyn HttpTransport>,
    credentials: CredentialResolver,
    tracker: Arc<RateLimitTracker>,
    cache: Arc<ConditionalCache>,
    policy: RetryPolicy,
    pacer: Option<ApiRateLimiter>,
    base_url: String,
    user_agent: String,
}

impl GitHubClient {
    /// Create a client with a reqwest transport built from `config`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::with_timeout(config.timeout)
            .map_err(|e| Error::client(0, &config.base_url, format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a client over an explicit transport.
    ///
    /// Tests use this to script responses; production callers can inject a
    /// shared connection pool.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let mut credentials = CredentialResolver::new(config.token_env.clone(), config.auth);
        if let Some(token) = &config.token {
            credentials = credentials.with_token(token.clone());
        }

        let mut tracker = RateLimitTracker::new(config.safety_margin);
        if let Some(path) = &config.tracker_snapshot_path {
            tracker = tracker.with_snapshot(path.clone());
        }

        let cache = match &config.cache_path {
            Some(path) => ConditionalCache::with_file(path.clone(), config.cache_max_age),
            None => ConditionalCache::in_memory(),
        };

        Self {
            transport,
            credentials,
            tracker: Arc::new(tracker),
            cache: Arc::new(cache),
            policy: RetryPolicy::new(config.backoff_base, config.backoff_max, config.max_retries),
            pacer: config.requests_per_second.map(ApiRateLimiter::new),
            base_url: config.base_url,
            user_agent: config.user_agent,
        }
    }

    /// The shared rate-limit tracker.
    #[must_use]
    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    /// The shared conditional cache.
    #[must_use]
    pub fn cache(&self) -> &ConditionalCache {
        &self.cache
    }

    /// Drop the cached entry for `spec`, forcing the next fetch to go out
    /// without a conditional header.
    pub fn invalidate(&self, spec: &RequestSpec) -> bool {
        self.invalidate_key(&spec.cache_key())
    }

    /// Drop the cached entry for an already-derived key.
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.cache.invalidate(key)
    }

    /// Iterate a list endpoint page by page. See [`Paginator`].
    #[must_use]
    pub fn paginate(&self, spec: RequestSpec) -> Paginator<'_> {
        Paginator::new(self, spec)
    }

    /// Execute `spec` and decode the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T> {
        let fetched = self.execute(spec).await?;
        fetched.json().map_err(|e| {
            Error::client(
                fetched.status,
                fetched.url.clone(),
                format!("response body is not valid JSON: {e}"),
            )
        })
    }

    /// Execute `spec` and return the body text.
    pub async fn get_text(&self, spec: &RequestSpec) -> Result<String> {
        Ok(self.execute(spec).await?.body)
    }

    /// Execute one logical call, recovering transient faults and rate
    /// limits internally.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Fetched> {
        let url = spec.url(&self.base_url);
        let resource = spec.resource();
        let key = spec.cache_key();
        let use_cache = spec.method() == HttpMethod::Get;

        // The key's critical section spans ETag snapshot through cache
        // store; see the cache module. Distinct keys proceed in parallel.
        let _key_guard = if use_cache {
            Some(self.cache.key_lock(&key).lock_owned().await)
        } else {
            None
        };

        let snapshot = if use_cache { self.cache.lookup(&key) } else { None };

        let mut conditional = snapshot;
        let mut refetched_unconditionally = false;
        let mut transient_attempts: u32 = 0;
        let mut limit_attempts: u32 = 0;

        loop {
            let throttle = self.tracker.reserve(resource);
            if !throttle.is_zero() {
                tracing::debug!(
                    resource = resource.as_str(),
                    wait_ms = throttle.as_millis() as u64,
                    url = %url,
                    "quota exhausted, throttling before dispatch"
                );
                tokio::time::sleep(throttle).await;
            }
            self.tracker.decrement_optimistic(resource);
            if let Some(pacer) = &self.pacer {
                pacer.wait().await;
            }

            let request = self.build_request(spec, &url, conditional.as_ref())?;
            let outcome = match self.transport.send(request).await {
                Ok(response) => {
                    if let Some((limit, remaining, reset_at)) =
                        parse_rate_limit_headers(&response.headers)
                    {
                        self.tracker.observe(resource, limit, remaining, reset_at);
                    }

                    match response.status {
                        200..=299 => {
                            let body = String::from_utf8_lossy(&response.body).into_owned();
                            if use_cache {
                                match response.header("etag") {
                                    Some(etag) => self.cache.store(
                                        &key,
                                        CacheEntry::new(
                                            etag,
                                            response.status,
                                            response.headers.clone(),
                                            body.clone(),
                                        ),
                                    ),
                                    // A fresh body with no ETag cannot be
                                    // revalidated; drop any stale entry.
                                    None => {
                                        let _ = self.cache.invalidate(&key);
                                    }
                                }
                            }
                            return Ok(Fetched {
                                url,
                                status: response.status,
                                headers: response.headers,
                                body,
                                freshness: Freshness::Fresh,
                            });
                        }
                        304 => {
                            if let Some(entry) = &conditional {
                                // Unchanged: serve the stored body, leave
                                // the cache untouched. Quota was still
                                // deducted and observed above.
                                return Ok(Fetched {
                                    url,
                                    status: entry.status,
                                    headers: entry.headers.clone(),
                                    body: entry.body.clone(),
                                    freshness: Freshness::Cached,
                                });
                            }
                            // 304 with nothing to serve: the entry vanished
                            // between snapshot and response, or the server
                            // is misbehaving. Refetch without a conditional
                            // header, once.
                            if !refetched_unconditionally {
                                refetched_unconditionally = true;
                                conditional = None;
                                tracing::warn!(url = %url, "304 without a cached body, refetching unconditionally");
                                continue;
                            }
                            Outcome::Transient {
                                detail: format!("unconditional request to {url} answered 304"),
                            }
                        }
                        status => classify(&url, status, &response.headers, &response.body, Utc::now()),
                    }
                }
                Err(e) => Outcome::Transient {
                    detail: e.to_string(),
                },
            };

            if let Outcome::SecondaryLimit { retry_at } = &outcome {
                self.tracker.record_secondary(resource, *retry_at);
            }

            let attempt = match &outcome {
                Outcome::Transient { .. } => transient_attempts,
                Outcome::PrimaryLimit { .. } | Outcome::SecondaryLimit { .. } => limit_attempts,
                _ => 0,
            };

            match self.policy.decide(attempt, &outcome, Utc::now()) {
                RetryDecision::RetryAfter(delay) => {
                    match &outcome {
                        Outcome::Transient { detail } => {
                            transient_attempts += 1;
                            tracing::debug!(
                                url = %url,
                                attempt = transient_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "transient failure, backing off: {detail}"
                            );
                        }
                        _ => {
                            limit_attempts += 1;
                            tracing::debug!(
                                url = %url,
                                delay_ms = delay.as_millis() as u64,
                                "rate limited, waiting for the reported deadline"
                            );
                        }
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fail(err) => return Err(err),
            }
        }
    }

    fn build_request(
        &self,
        spec: &RequestSpec,
        url: &str,
        conditional: Option<&CacheEntry>,
    ) -> Result<HttpRequest> {
        let mut headers: HttpHeaders = vec![
            (
                "Accept".to_string(),
                "application/vnd.github+json".to_string(),
            ),
            (
                "X-GitHub-Api-Version".to_string(),
                "2022-11-28".to_string(),
            ),
            ("User-Agent".to_string(), self.user_agent.clone()),
        ];

        // Credentials re-resolve per attempt so a rotated token is picked
        // up without restarting the run.
        if let Some(token) = self.credentials.resolve()? {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }

        for (name, value) in spec.extra_headers() {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }

        if let Some(entry) = conditional {
            headers.push(("If-None-Match".to_string(), entry.etag.clone()));
        }

        Ok(HttpRequest {
            method: spec.method(),
            url: url.to_string(),
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{MockTransport, response};
    use crate::request::Resource;
    use chrono::TimeDelta;
    use std::time::Duration;

    const BASE: &str = "https://api.github.com";

    fn test_config() -> ClientConfig {
        ClientConfig::default()
            .with_auth(crate::credentials::AuthMode::None)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(80), 6)
            .with_cache_path(None)
    }

    fn client(transport: &MockTransport) -> GitHubClient {
        let mut client = GitHubClient::with_transport(test_config(), Arc::new(transport.clone()));
        client.policy = client.policy.clone().with_jitter(false);
        client
    }

    #[tokio::test]
    async fn fresh_fetch_returns_body_and_stores_etag() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        transport.push_response(
            HttpMethod::Get,
            spec.url(BASE),
            response(200, &[("ETag", "W/\"v1\"")], "{\"id\":1}"),
        );

        let client = client(&transport);
        let fetched = client.execute(&spec).await.expect("execute");
        assert_eq!(fetched.freshness, Freshness::Fresh);
        assert_eq!(fetched.body, "{\"id\":1}");

        let entry = client.cache().lookup(&spec.cache_key()).expect("cached");
        assert_eq!(entry.etag, "W/\"v1\"");
        assert_eq!(entry.body, "{\"id\":1}");
    }

    #[tokio::test]
    async fn not_modified_serves_cached_body_without_rewrite() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        transport.push_response(
            HttpMethod::Get,
            url.as_str(),
            response(200, &[("ETag", "W/\"v1\"")], "{\"id\":1}"),
        );
        transport.push_response(HttpMethod::Get, url.as_str(), response(304, &[], ""));

        let client = client(&transport);
        let first = client.execute(&spec).await.expect("first");
        let stored_at = client.cache().lookup(&spec.cache_key()).expect("entry").stored_at;

        let second = client.execute(&spec).await.expect("second");
        assert_eq!(second.freshness, Freshness::Cached);
        // Byte-identical to the first fetch's stored body.
        assert_eq!(second.body, first.body);
        // The conditional header carried the snapshot ETag.
        assert_eq!(
            transport.requests()[1].header("if-none-match"),
            Some("W/\"v1\"")
        );
        // 304 leaves the entry untouched.
        assert_eq!(
            client.cache().lookup(&spec.cache_key()).expect("entry").stored_at,
            stored_at
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        transport.push_response(HttpMethod::Get, url.as_str(), response(500, &[], "boom"));
        transport.push_response(HttpMethod::Get, url.as_str(), response(502, &[], "boom"));
        transport.push_response(HttpMethod::Get, url.as_str(), response(200, &[], "ok"));

        let client = client(&transport);
        let fetched = client.execute(&spec).await.expect("eventual success");
        assert_eq!(fetched.body, "ok");
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_the_ceiling() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        for _ in 0..3 {
            transport.push_response(HttpMethod::Get, url.as_str(), response(503, &[], ""));
        }

        let mut config = test_config();
        config.max_retries = 2;
        let client = GitHubClient::with_transport(config, Arc::new(transport.clone()));

        let err = client.execute(&spec).await.expect_err("should exhaust");
        match err {
            Error::TransientExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn unauthorized_fails_without_retry() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/user");
        transport.push_response(
            HttpMethod::Get,
            spec.url(BASE),
            response(401, &[], "{\"message\":\"Bad credentials\"}"),
        );

        let client = client(&transport);
        let err = client.execute(&spec).await.expect_err("unauthorized");
        assert!(matches!(err, Error::Unauthorized { status: 401 }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn not_found_fails_without_retry() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/missing");
        transport.push_response(
            HttpMethod::Get,
            spec.url(BASE),
            response(404, &[], "{\"message\":\"Not Found\"}"),
        );

        let client = client(&transport);
        let err = client.execute(&spec).await.expect_err("not found");
        assert!(matches!(err, Error::ClientError { status: 404, .. }));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn secondary_limit_retries_once_at_the_reported_deadline() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        transport.push_response(
            HttpMethod::Get,
            url.as_str(),
            response(
                403,
                &[("Retry-After", "7")],
                "{\"message\":\"You have exceeded a secondary rate limit.\"}",
            ),
        );
        transport.push_response(HttpMethod::Get, url.as_str(), response(200, &[], "ok"));

        let client = client(&transport);
        let start = tokio::time::Instant::now();
        let fetched = client.execute(&spec).await.expect("retry succeeds");
        assert_eq!(fetched.body, "ok");
        assert_eq!(transport.requests().len(), 2);
        // The wait matched the server's deadline, not the backoff curve.
        assert!(start.elapsed() >= Duration::from_secs(6), "elapsed {:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn still_rate_limited_after_the_wait_surfaces_the_error() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        let reset = (Utc::now() + TimeDelta::seconds(2)).timestamp().to_string();
        for _ in 0..2 {
            transport.push_response(
                HttpMethod::Get,
                url.as_str(),
                response(
                    403,
                    &[
                        ("X-RateLimit-Limit", "60"),
                        ("X-RateLimit-Remaining", "0"),
                        ("X-RateLimit-Reset", reset.as_str()),
                    ],
                    "{\"message\":\"API rate limit exceeded\"}",
                ),
            );
        }

        let client = client(&transport);
        let err = client.execute(&spec).await.expect_err("still limited");
        assert!(err.is_rate_limited());
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_throttles_before_dispatch() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        transport.push_response(HttpMethod::Get, spec.url(BASE), response(200, &[], "ok"));

        let client = client(&transport);
        client
            .tracker()
            .observe(Resource::Core, 60, 0, Utc::now() + TimeDelta::seconds(30));

        let start = tokio::time::Instant::now();
        let fetched = client.execute(&spec).await.expect("after throttle");
        assert_eq!(fetched.body, "ok");
        // Pre-emptive throttling, not a retry: a single dispatch.
        assert_eq!(transport.requests().len(), 1);
        assert!(start.elapsed() >= Duration::from_secs(29), "elapsed {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn invalidate_forces_an_unconditional_fetch() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        transport.push_response(
            HttpMethod::Get,
            url.as_str(),
            response(200, &[("ETag", "W/\"v1\"")], "one"),
        );
        transport.push_response(
            HttpMethod::Get,
            url.as_str(),
            response(200, &[("ETag", "W/\"v2\"")], "two"),
        );

        let client = client(&transport);
        let _ = client.execute(&spec).await.expect("first");
        assert!(client.invalidate(&spec));

        let second = client.execute(&spec).await.expect("second");
        assert_eq!(second.freshness, Freshness::Fresh);
        assert_eq!(second.body, "two");
        assert_eq!(transport.requests()[1].header("if-none-match"), None);
    }

    #[tokio::test]
    async fn limit_headers_feed_the_tracker() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/search/issues").query("q", "bug");
        transport.push_response(
            HttpMethod::Get,
            spec.url(BASE),
            response(
                200,
                &[
                    ("X-RateLimit-Limit", "30"),
                    ("X-RateLimit-Remaining", "29"),
                    ("X-RateLimit-Reset", "1700000000"),
                ],
                "{}",
            ),
        );

        let client = client(&transport);
        let _ = client.execute(&spec).await.expect("execute");

        let state = client.tracker().state(Resource::Search).expect("observed");
        assert_eq!(state.limit, 30);
        assert_eq!(state.remaining, 29);
    }

    #[tokio::test]
    async fn concurrent_calls_share_the_tracker_without_lost_updates() {
        let transport = MockTransport::new();
        let client = client(&transport);
        client
            .tracker()
            .observe(Resource::Core, 5000, 50, Utc::now() + TimeDelta::seconds(3600));

        let mut specs = Vec::new();
        for i in 0..10 {
            let spec = RequestSpec::get(format!("/repos/org/repo-{i}"));
            // No limit headers, so observe never overwrites the estimate.
            transport.push_response(HttpMethod::Get, spec.url(BASE), response(200, &[], "{}"));
            specs.push(spec);
        }

        let mut handles = Vec::new();
        for spec in specs {
            let task_client = client.clone();
            handles.push(tokio::spawn(async move {
                task_client.execute(&spec).await.map(|f| f.status)
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("execute"), 200);
        }

        assert_eq!(client.tracker().state(Resource::Core).expect("state").remaining, 40);
    }

    #[tokio::test]
    async fn fresh_200_without_etag_drops_the_stale_entry() {
        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        let url = spec.url(BASE);
        transport.push_response(
            HttpMethod::Get,
            url.as_str(),
            response(200, &[("ETag", "W/\"v1\"")], "one"),
        );
        transport.push_response(HttpMethod::Get, url.as_str(), response(200, &[], "two"));

        let client = client(&transport);
        let _ = client.execute(&spec).await.expect("first");
        assert!(client.cache().lookup(&spec.cache_key()).is_some());

        let second = client.execute(&spec).await.expect("second");
        assert_eq!(second.body, "two");
        assert!(client.cache().lookup(&spec.cache_key()).is_none());
    }

    #[tokio::test]
    async fn get_json_decodes_into_caller_shape() {
        #[derive(serde::Deserialize)]
        struct Repo {
            id: u64,
            name: String,
        }

        let transport = MockTransport::new();
        let spec = RequestSpec::get("/repos/a/b");
        transport.push_response(
            HttpMethod::Get,
            spec.url(BASE),
            response(200, &[], "{\"id\":7,\"name\":\"b\"}"),
        );

        let client = client(&transport);
        let repo: Repo = client.get_json(&spec).await.expect("decode");
        assert_eq!(repo.id, 7);
        assert_eq!(repo.name, "b");
    }
}
