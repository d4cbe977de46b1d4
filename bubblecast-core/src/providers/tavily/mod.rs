use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{
    config::SearchCfg,
    error::CoreResult,
    http_client::{HttpClient, RequestCtx},
};

pub const MAX_NEWS_RESULTS: u32 = 30;

/// Web search provider (Tavily): free-form search and the daily news feed.
#[derive(Debug, Clone)]
pub struct Tavily {
    http: HttpClient,
    api_key: SecretString,
    base: String,
    name: String,
}

impl Tavily {
    pub fn new(http: HttpClient, api_key: SecretString, base: String) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            name: "tavily".into(),
        }
    }

    fn url(&self) -> String {
        format!("{}/search", self.base)
    }

    /// Plain web search with a synthesized answer.
    pub async fn search(
        &self,
        query: &str,
        max_results: u32,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SearchResults> {
        let payload = TSearchReq {
            api_key: self.api_key.expose_secret(),
            query,
            search_depth: "advanced",
            max_results,
            include_answer: true,
            time_range: None,
            include_images: None,
            include_raw_content: None,
        };
        let ctx = RequestCtx {
            provider: Some(&self.name),
            ..*ctx
        };
        let (resp, _, latency_ms) = self
            .http
            .post_json::<_, TSearchResp>(&self.url(), &payload, &[], &ctx)
            .await?;
        tracing::debug!(provider = %self.name, latency_ms, results = resp.results.len(), "search");
        Ok(SearchResults {
            ok: true,
            results: resp.results,
            answer: resp.answer.unwrap_or_default(),
        })
    }

    /// Today's news matching `q`, reduced to the fields the site renders.
    pub async fn live_news(&self, q: &NewsQuery, ctx: &RequestCtx<'_>) -> CoreResult<LiveNews> {
        let payload = TSearchReq {
            api_key: self.api_key.expose_secret(),
            query: &q.query,
            search_depth: &q.search_depth,
            max_results: q.max_results.clamp(1, MAX_NEWS_RESULTS),
            include_answer: false,
            time_range: Some(&q.time_range),
            include_images: Some(false),
            include_raw_content: Some(false),
        };
        let ctx = RequestCtx {
            provider: Some(&self.name),
            ..*ctx
        };
        let (resp, _, _) = self
            .http
            .post_json::<_, TSearchResp>(&self.url(), &payload, &[], &ctx)
            .await?;

        let items = resp
            .results
            .iter()
            .map(NewsItem::from_result)
            .collect();
        Ok(LiveNews {
            ok: true,
            query: q.query.clone(),
            items,
        })
    }
}

/// Parameters of a live news lookup; unset fields come from [`SearchCfg`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsQuery {
    pub query: String,
    pub max_results: u32,
    pub time_range: String,
    pub search_depth: String,
}

impl NewsQuery {
    pub fn from_parts(
        cfg: &SearchCfg,
        query: Option<String>,
        max_results: Option<u32>,
        time_range: Option<String>,
        search_depth: Option<String>,
    ) -> Self {
        let nonblank = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
        Self {
            query: nonblank(query).unwrap_or_else(|| cfg.news_query.clone()),
            max_results: max_results.unwrap_or(cfg.news_max_results),
            time_range: nonblank(time_range).unwrap_or_else(|| cfg.time_range.clone()),
            search_depth: nonblank(search_depth).unwrap_or_else(|| cfg.search_depth.clone()),
        }
    }
}

#[derive(Serialize)]
struct TSearchReq<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    max_results: u32,
    include_answer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_range: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_images: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_raw_content: Option<bool>,
}

#[derive(Deserialize)]
struct TSearchResp {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResults {
    pub ok: bool,
    pub results: Vec<serde_json::Value>,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsItem {
    pub title: String,
    pub url: Option<String>,
    pub snippet: String,
    pub score: f64,
    pub published_time: Option<String>,
}

impl NewsItem {
    fn from_result(v: &serde_json::Value) -> Self {
        let s = |k: &str| v.get(k).and_then(|x| x.as_str()).map(str::to_string);
        Self {
            title: s("title").filter(|t| !t.is_empty()).unwrap_or_else(|| "Untitled".into()),
            url: s("url"),
            snippet: s("content").unwrap_or_default(),
            score: v.get("score").and_then(|x| x.as_f64()).unwrap_or(0.0),
            published_time: s("published_time").or_else(|| s("published_date")).or_else(|| s("published")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveNews {
    pub ok: bool,
    pub query: String,
    pub items: Vec<NewsItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use httpmock::prelude::*;
    use serde_json::json;

    fn tavily(base: String) -> Tavily {
        Tavily::new(
            HttpClient::new_default().unwrap(),
            SecretString::from("tv-key".to_string()),
            base,
        )
    }

    #[tokio::test]
    async fn search_returns_results_and_answer() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/search")
                    .json_body_partial(r#"{"api_key":"tv-key","query":"rust","max_results":7,"include_answer":true}"#);
                then.status(200).json_body(json!({
                    "results": [{"title": "Rust", "url": "https://rust-lang.org"}],
                    "answer": "A language."
                }));
            })
            .await;
        let res = tavily(server.base_url())
            .search("rust", 7, &RequestCtx::default())
            .await
            .unwrap();
        assert!(res.ok);
        assert_eq!(res.results.len(), 1);
        assert_eq!(res.answer, "A language.");
        m.assert_async().await;
    }

    #[tokio::test]
    async fn live_news_maps_items_and_clamps_max() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/search")
                    .json_body_partial(r#"{"max_results":30,"time_range":"week","include_answer":false}"#);
                then.status(200).json_body(json!({
                    "results": [
                        {"title": "", "url": "https://a", "content": "snip", "score": 0.9, "published_date": "2024-05-01"},
                        {"url": "https://b"}
                    ]
                }));
            })
            .await;
        let q = NewsQuery {
            query: "ai".into(),
            max_results: 99,
            time_range: "week".into(),
            search_depth: "basic".into(),
        };
        let news = tavily(server.base_url())
            .live_news(&q, &RequestCtx::default())
            .await
            .unwrap();
        assert_eq!(news.query, "ai");
        assert_eq!(news.items.len(), 2);
        assert_eq!(news.items[0].title, "Untitled");
        assert_eq!(news.items[0].snippet, "snip");
        assert_eq!(news.items[0].published_time.as_deref(), Some("2024-05-01"));
        assert_eq!(news.items[1].score, 0.0);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn auth_failure_keeps_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/search");
                then.status(401).json_body(json!({"detail": {"error": "Unauthorized"}}));
            })
            .await;
        let err = tavily(server.base_url())
            .search("x", 1, &RequestCtx::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ProviderError { ref code, .. } if code == "401"));
        assert_eq!(err.status(), http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn news_query_defaults() {
        let cfg = SearchCfg::default();
        let q = NewsQuery::from_parts(&cfg, Some(" ".into()), None, None, Some("advanced".into()));
        assert_eq!(q.query, cfg.news_query);
        assert_eq!(q.max_results, 18);
        assert_eq!(q.time_range, "day");
        assert_eq!(q.search_depth, "advanced");
    }
}
