//! Search-provider contracts + the Serper-style JSON search adapter.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobhound_core::{posted_hint_from_snippet, LeadDraft};
use jobhound_storage::{FetchError, SearchHttpClient};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobhound-sources";

/// One entry of the root-level query registry. The provider query string is
/// configuration, not behavior; the pipeline treats it as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub query_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub q: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_max_results() -> u32 {
    20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("search request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid search response for {query_id}: {message}")]
    Parse { query_id: String, message: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A search backend that can produce raw response bodies for a query.
/// Parsing is kept separate so captured bodies replay through the same path
/// as live fetches.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn fetch_raw(
        &self,
        http: &SearchHttpClient,
        ctx: &SearchContext,
        query: &QuerySpec,
    ) -> Result<Vec<u8>, SourceError>;
}

/// Live web-search provider speaking the Serper wire format: a POST of
/// `{"q": …, "num": …}` authenticated by the `X-API-KEY` header.
#[derive(Debug, Clone)]
pub struct SerperProvider {
    endpoint: String,
}

impl SerperProvider {
    pub const DEFAULT_ENDPOINT: &'static str = "https://google.serper.dev/search";

    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for SerperProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ENDPOINT)
    }
}

#[async_trait]
impl SearchProvider for SerperProvider {
    fn provider_id(&self) -> &'static str {
        "serper"
    }

    async fn fetch_raw(
        &self,
        http: &SearchHttpClient,
        ctx: &SearchContext,
        query: &QuerySpec,
    ) -> Result<Vec<u8>, SourceError> {
        let payload = serde_json::json!({
            "q": query.q,
            "num": query.max_results,
        });
        let response = http
            .post_json(ctx.run_id, &query.query_id, &self.endpoint, &payload)
            .await?;
        debug!(
            query_id = %query.query_id,
            bytes = response.body.len(),
            "search response received"
        );
        Ok(response.body)
    }
}

/// Offline provider returning canned response bodies from
/// `<root>/<query_id>.json`. Used by tests and `hunt --offline`.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    root: PathBuf,
}

impl FixtureProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, query_id: &str) -> PathBuf {
        self.root.join(format!("{query_id}.json"))
    }
}

#[async_trait]
impl SearchProvider for FixtureProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_raw(
        &self,
        _http: &SearchHttpClient,
        _ctx: &SearchContext,
        query: &QuerySpec,
    ) -> Result<Vec<u8>, SourceError> {
        let path = self.fixture_path(&query.query_id);
        fs::read(&path).await.map_err(|source| SourceError::Fixture {
            path: path.clone(),
            source,
        })
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Turns a raw search response into lead drafts.
///
/// Hits missing `link` or `title` still yield a draft with the field empty;
/// dropping records is the reconciler's decision, not the parser's. A body
/// without an `organic` array is a legitimate empty result page.
pub fn parse_search_response(query_id: &str, body: &[u8]) -> Result<Vec<LeadDraft>, SourceError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|err| SourceError::Parse {
        query_id: query_id.to_string(),
        message: err.to_string(),
    })?;

    let Some(organic) = value.get("organic").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    let mut drafts = Vec::with_capacity(organic.len());
    for hit in organic {
        let url = json_str(hit, &["link"]).unwrap_or_default().to_string();
        let title = json_str(hit, &["title"]).unwrap_or_default().to_string();
        let snippet = json_str(hit, &["snippet"]).map(ToString::to_string);
        let posted_hint = json_str(hit, &["date"])
            .map(ToString::to_string)
            .or_else(|| snippet.as_deref().and_then(posted_hint_from_snippet));

        drafts.push(LeadDraft {
            url,
            title,
            snippet,
            posted_hint,
            company: None,
            score: None,
        });
    }
    Ok(drafts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE_BODY: &str = r#"{
        "searchParameters": {"q": "intitle:\"Data Analyst\"", "num": 20},
        "organic": [
            {
                "title": "Data Analyst at Acme Corp",
                "link": "https://boards.greenhouse.io/acme/jobs/1",
                "snippet": "Posted 3 days ago. Own our metrics pipeline.",
                "position": 1
            },
            {
                "title": "Untracked posting without a link",
                "snippet": "No link field on this hit.",
                "position": 2
            },
            {
                "title": "BI Analyst | Globex",
                "link": "https://jobs.lever.co/globex/7",
                "date": "1 week ago",
                "position": 3
            }
        ]
    }"#;

    #[test]
    fn sample_response_parses_into_drafts() {
        let drafts = parse_search_response("greenhouse-data-analyst", SAMPLE_BODY.as_bytes())
            .expect("parse");
        assert_eq!(drafts.len(), 3);

        assert_eq!(drafts[0].url, "https://boards.greenhouse.io/acme/jobs/1");
        assert_eq!(drafts[0].title, "Data Analyst at Acme Corp");
        assert_eq!(drafts[0].posted_hint.as_deref(), Some("3 days ago"));

        // A hit without a link is surfaced, not swallowed.
        assert!(drafts[1].url.is_empty());
        assert_eq!(drafts[1].title, "Untracked posting without a link");

        // Explicit date field wins over snippet scraping.
        assert_eq!(drafts[2].posted_hint.as_deref(), Some("1 week ago"));
    }

    #[test]
    fn missing_organic_array_is_an_empty_page() {
        let drafts = parse_search_response("q", br#"{"credits": 1}"#).expect("parse");
        assert!(drafts.is_empty());
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = parse_search_response("q", b"<html>rate limited</html>").unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));
    }

    #[tokio::test]
    async fn fixture_provider_reads_canned_bodies() {
        let dir = tempdir().expect("tempdir");
        let provider = FixtureProvider::new(dir.path());
        let query = QuerySpec {
            query_id: "greenhouse-data-analyst".to_string(),
            display_name: "Data Analyst".to_string(),
            enabled: true,
            q: "intitle:\"Data Analyst\"".to_string(),
            max_results: 20,
        };
        fs::write(provider.fixture_path(&query.query_id), SAMPLE_BODY)
            .await
            .unwrap();

        let http = SearchHttpClient::new(Default::default()).expect("client");
        let ctx = SearchContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        };
        let body = provider.fetch_raw(&http, &ctx, &query).await.expect("fixture");
        let drafts = parse_search_response(&query.query_id, &body).expect("parse");
        assert_eq!(drafts.len(), 3);
    }
}
