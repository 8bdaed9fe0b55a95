//! Lazy, forward-only pagination over list endpoints.
//!
//! GitHub signals continuation through the `Link` header; the `rel="next"`
//! URL is the opaque cursor. Every page fetch runs the full executor
//! pipeline, so conditional caching and rate limiting apply per page, and a
//! consumer that stops early (or drops the paginator) never pays for the
//! pages it did not ask for.

use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, Result};
use crate::executor::{Fetched, GitHubClient};
use crate::request::RequestSpec;

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in the order the server returned them.
    pub items: Vec<T>,
    /// Continuation cursor for the following page, if any.
    pub next_cursor: Option<String>,
}

/// Forward-only iterator over the pages of a list endpoint.
///
/// Not restartable mid-sequence: restarting means building a new paginator
/// from the initial spec. Consumers that need resumability persist the last
/// cursor themselves and re-enter through [`RequestSpec`].
pub struct Paginator<'a> {
    client: &'a GitHubClient,
    next: Option<RequestSpec>,
    item_key: Option<String>,
    limit_pages: Option<u32>,
    pages_fetched: u32,
}

impl<'a> Paginator<'a> {
    pub(crate) fn new(client: &'a GitHubClient, spec: RequestSpec) -> Self {
        let spec = if spec.has_query("per_page") {
            spec
        } else {
            spec.query("per_page", "100")
        };
        Self {
            client,
            next: Some(spec),
            item_key: None,
            limit_pages: None,
            pages_fetched: 0,
        }
    }

    /// For object-shaped payloads (e.g. search results), the field holding
    /// the item array. List-shaped payloads need no key.
    #[must_use]
    pub fn item_key(mut self, key: impl Into<String>) -> Self {
        self.item_key = Some(key.into());
        self
    }

    /// Stop after at most `limit` pages.
    #[must_use]
    pub fn limit_pages(mut self, limit: u32) -> Self {
        self.limit_pages = Some(limit);
        self
    }

    /// Fetch the next page, or `None` once the sequence is exhausted.
    pub async fn next_page<T: DeserializeOwned>(&mut self) -> Result<Option<Page<T>>> {
        if let Some(limit) = self.limit_pages
            && self.pages_fetched >= limit
        {
            self.next = None;
        }
        let Some(spec) = self.next.take() else {
            return Ok(None);
        };

        let fetched = self.client.execute(&spec).await?;
        self.pages_fetched += 1;

        let next_cursor = fetched.header("link").and_then(parse_next_link);
        self.next = match &next_cursor {
            Some(cursor) => Some(spec_from_cursor(cursor)?),
            None => None,
        };

        let items = extract_items(&fetched, self.item_key.as_deref())?;
        Ok(Some(Page { items, next_cursor }))
    }

    /// Drain the remaining pages into one flat vector.
    pub async fn collect_items<T: DeserializeOwned>(&mut self) -> Result<Vec<T>> {
        let mut all = Vec::new();
        while let Some(mut page) = self.next_page::<T>().await? {
            all.append(&mut page.items);
        }
        Ok(all)
    }
}

/// Extract the `rel="next"` URL from a `Link` header.
///
/// GitHub Link headers look like:
/// `<https://api.github.com/repositories/1/issues?page=2>; rel="next", <...&page=5>; rel="last"`
#[must_use]
pub fn parse_next_link(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let part = part.trim();

        let mut url = None;
        let mut rel = None;
        for segment in part.split(';') {
            let segment = segment.trim();
            if segment.starts_with('<') && segment.ends_with('>') {
                url = Some(&segment[1..segment.len() - 1]);
            } else if let Some(rel_value) = segment.strip_prefix("rel=") {
                rel = Some(rel_value.trim_matches('"'));
            }
        }

        if let (Some(url), Some("next")) = (url, rel) {
            return Some(url.to_string());
        }
    }
    None
}

/// Turn a continuation URL back into a [`RequestSpec`], so the page fetch
/// flows through the same cache-key derivation as any other call.
fn spec_from_cursor(cursor: &str) -> Result<RequestSpec> {
    let url = Url::parse(cursor)
        .map_err(|e| Error::client(0, cursor, format!("malformed continuation URL: {e}")))?;
    let spec = RequestSpec::get(url.path()).queries(
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned())),
    );
    Ok(spec)
}

fn extract_items<T: DeserializeOwned>(fetched: &Fetched, item_key: Option<&str>) -> Result<Vec<T>> {
    let decode_err = |e: serde_json::Error| {
        Error::client(
            fetched.status,
            fetched.url.clone(),
            format!("page payload did not decode: {e}"),
        )
    };

    let value: serde_json::Value = fetched.json().map_err(decode_err)?;
    let array = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match item_key.and_then(|k| map.remove(k)) {
            Some(serde_json::Value::Array(items)) => items,
            // Object payload without a matching item key yields nothing.
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    array
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(decode_err))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::credentials::AuthMode;
    use crate::executor::GitHubClient;
    use crate::http::{HttpMethod, MockTransport, response};
    use std::sync::Arc;

    const BASE: &str = "https://api.github.com";

    fn client(transport: &MockTransport) -> GitHubClient {
        let config = ClientConfig::default()
            .with_auth(AuthMode::None)
            .with_cache_path(None);
        GitHubClient::with_transport(config, Arc::new(transport.clone()))
    }

    fn link_next(url: &str) -> String {
        format!("<{url}>; rel=\"next\", <{url}>; rel=\"last\"")
    }

    /// Script a 3-page listing of 2 items per page under /orgs/acme/repos.
    fn script_three_pages(transport: &MockTransport) {
        let page2 = format!("{BASE}/orgs/acme/repos?page=2&per_page=100");
        let page3 = format!("{BASE}/orgs/acme/repos?page=3&per_page=100");

        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/orgs/acme/repos?per_page=100"),
            response(200, &[("Link", &link_next(&page2))], "[1,2]"),
        );
        transport.push_response(
            HttpMethod::Get,
            page2.clone(),
            response(200, &[("Link", &link_next(&page3))], "[3,4]"),
        );
        transport.push_response(HttpMethod::Get, page3, response(200, &[], "[5,6]"));
    }

    #[test]
    fn parse_next_link_extracts_the_next_url() {
        let header = r#"<https://api.github.com/organizations/1/repos?per_page=100&page=2>; rel="next", <https://api.github.com/organizations/1/repos?per_page=100&page=3>; rel="last""#;
        assert_eq!(
            parse_next_link(header),
            Some("https://api.github.com/organizations/1/repos?per_page=100&page=2".to_string())
        );
    }

    #[test]
    fn parse_next_link_without_next_relation() {
        let header = r#"<https://api.github.com/organizations/1/repos?per_page=100&page=3>; rel="last""#;
        assert_eq!(parse_next_link(header), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn cursor_round_trips_into_an_equivalent_spec() {
        let spec = spec_from_cursor("https://api.github.com/orgs/acme/repos?page=2&per_page=100")
            .expect("cursor parses");
        assert_eq!(spec.path(), "/orgs/acme/repos");
        assert_eq!(spec.url(BASE), format!("{BASE}/orgs/acme/repos?page=2&per_page=100"));
    }

    #[test]
    fn malformed_cursor_is_a_client_error() {
        let err = spec_from_cursor("::not a url::").expect_err("should fail");
        assert!(matches!(err, Error::ClientError { status: 0, .. }));
    }

    #[tokio::test]
    async fn three_pages_yield_six_items_in_order() {
        let transport = MockTransport::new();
        script_three_pages(&transport);

        let client = client(&transport);
        let mut paginator = client.paginate(RequestSpec::get("/orgs/acme/repos"));
        let items: Vec<u32> = paginator.collect_items().await.expect("all pages");
        assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn stopping_after_page_one_fetches_nothing_further() {
        let transport = MockTransport::new();
        script_three_pages(&transport);

        let client = client(&transport);
        let mut paginator = client.paginate(RequestSpec::get("/orgs/acme/repos"));
        let page = paginator
            .next_page::<u32>()
            .await
            .expect("page one")
            .expect("present");
        assert_eq!(page.items, vec![1, 2]);
        assert!(page.next_cursor.is_some());
        drop(paginator);

        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn limit_pages_caps_the_sequence() {
        let transport = MockTransport::new();
        script_three_pages(&transport);

        let client = client(&transport);
        let mut paginator = client
            .paginate(RequestSpec::get("/orgs/acme/repos"))
            .limit_pages(2);
        let items: Vec<u32> = paginator.collect_items().await.expect("two pages");
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn item_key_extracts_from_object_payloads() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/search/issues?per_page=100&q=bug"),
            response(
                200,
                &[],
                "{\"total_count\":2,\"items\":[{\"n\":1},{\"n\":2}]}",
            ),
        );

        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Hit {
            n: u32,
        }

        let client = client(&transport);
        let mut paginator = client
            .paginate(RequestSpec::get("/search/issues").query("q", "bug"))
            .item_key("items");
        let items: Vec<Hit> = paginator.collect_items().await.expect("search page");
        assert_eq!(items, vec![Hit { n: 1 }, Hit { n: 2 }]);
    }

    #[tokio::test]
    async fn object_payload_without_item_key_yields_nothing() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/search/issues?per_page=100&q=bug"),
            response(200, &[], "{\"total_count\":2,\"items\":[{\"n\":1}]}"),
        );

        let client = client(&transport);
        let mut paginator = client.paginate(RequestSpec::get("/search/issues").query("q", "bug"));
        let items: Vec<serde_json::Value> = paginator.collect_items().await.expect("page");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn explicit_per_page_is_preserved() {
        let transport = MockTransport::new();
        transport.push_response(
            HttpMethod::Get,
            format!("{BASE}/orgs/acme/repos?per_page=5"),
            response(200, &[], "[1]"),
        );

        let client = client(&transport);
        let mut paginator =
            client.paginate(RequestSpec::get("/orgs/acme/repos").query("per_page", "5"));
        let items: Vec<u32> = paginator.collect_items().await.expect("page");
        assert_eq!(items, vec![1]);
    }
}
