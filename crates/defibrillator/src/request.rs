//! Logical request descriptions and cache-key derivation.
//!
//! A [`RequestSpec`] identifies one logical API call independent of any
//! pagination cursor. Two specs that differ only in query-parameter order
//! are the same call and derive the same [`CacheKey`].

use std::fmt;

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::http::{HttpHeaders, HttpMethod};

/// Rate-limit resource classes GitHub accounts separately.
///
/// Classification happens from the request path *before* dispatch: the
/// response headers that name the resource only arrive after the call, too
/// late to decide whether to pre-throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Core,
    Search,
    Graphql,
}

impl Resource {
    /// Classify a request path into its rate-limit resource.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.trim_start_matches('/');
        if trimmed == "graphql" || trimmed.starts_with("graphql/") {
            Resource::Graphql
        } else if trimmed == "search" || trimmed.starts_with("search/") {
            Resource::Search
        } else {
            Resource::Core
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Core => "core",
            Resource::Search => "search",
            Resource::Graphql => "graphql",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic cache lookup key derived from a [`RequestSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical API call: method, path, query parameters, extra headers.
///
/// Immutable once built (the builder methods consume `self`). Query
/// parameters keep their insertion order in the struct, but both URL
/// construction and cache-key derivation sort them, so ordering never
/// changes what gets dispatched or where it is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
}

impl RequestSpec {
    /// Create a spec for an arbitrary method and path.
    ///
    /// The path is normalized to a single leading slash; trailing slashes
    /// are dropped so `/repos/a/b/` and `/repos/a/b` are one resource.
    pub fn new(method: HttpMethod, path: impl AsRef<str>) -> Self {
        Self {
            method,
            path: normalize_path(path.as_ref()),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Create a GET spec.
    pub fn get(path: impl AsRef<str>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    /// Add one query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add several query parameters.
    #[must_use]
    pub fn queries<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Add an extra request header (e.g. an alternate Accept).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    #[must_use]
    pub fn extra_headers(&self) -> &HttpHeaders {
        &self.headers
    }

    /// Whether a query parameter with this name is already present.
    #[must_use]
    pub fn has_query(&self, key: &str) -> bool {
        self.query.iter().any(|(k, _)| k == key)
    }

    /// The rate-limit resource this call counts against.
    #[must_use]
    pub fn resource(&self) -> Resource {
        Resource::from_path(&self.path)
    }

    /// Derive the cache key: method + normalized path + sorted query.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        let mut key = format!("{} {}", self.method.as_str(), self.path);
        let encoded = self.encoded_query();
        if !encoded.is_empty() {
            key.push('?');
            key.push_str(&encoded);
        }
        CacheKey(key)
    }

    /// Build the full request URL against `base_url`.
    ///
    /// Query parameters are sorted before encoding, matching the cache key.
    #[must_use]
    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        let encoded = self.encoded_query();
        if encoded.is_empty() {
            format!("{}{}", base, self.path)
        } else {
            format!("{}{}?{}", base, self.path, encoded)
        }
    }

    fn encoded_query(&self) -> String {
        let mut pairs: Vec<&(String, String)> = self.query.iter().collect();
        pairs.sort();
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in pairs {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    format!("/{trimmed}")
}
