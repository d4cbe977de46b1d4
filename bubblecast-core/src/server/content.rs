use std::path::Path;

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, AppState, error_body, request_id};
use crate::{
    error::{CoreResult, RelayError},
    http_client::RequestCtx,
    providers::{
        perplexity::WeeklyDigest,
        tavily::{LiveNews, NewsQuery, SearchResults},
    },
};

/// Read a JSON document from the content directory. A document that does not
/// parse is served as `[]`; a missing one is an error.
async fn read_document(dir: &Path, name: &str) -> CoreResult<Value> {
    let text = tokio::fs::read_to_string(dir.join(name)).await?;
    Ok(serde_json::from_str(&text).unwrap_or_else(|e| {
        tracing::warn!(document = name, error = %e, "unparsable content document");
        Value::Array(Vec::new())
    }))
}

async fn document(state: &AppState, name: &str) -> Result<Json<Value>, ApiError> {
    Ok(Json(read_document(&state.content_dir(), name).await?))
}

pub(crate) async fn news(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    document(&state, "news.json").await
}

pub(crate) async fn daily(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    document(&state, "daily.json").await
}

pub(crate) async fn models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    document(&state, "models.json").await
}

pub(crate) async fn rubrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    document(&state, "rubrics.json").await
}

pub(crate) async fn top_prompts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    document(&state, "prompt.json").await
}

pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({
        "ok": true,
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDescriptor {
    pub analytics: AnalyticsDescriptor,
    pub search: SearchDescriptor,
    pub chat: ChatDescriptor,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsDescriptor {
    pub enabled: bool,
    pub provider: String,
    pub script_url: String,
    pub website_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchDescriptor {
    pub tavily_enabled: bool,
    pub max_results: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatDescriptor {
    pub sse: bool,
    pub default_model: String,
}

/// `GET /api/config`: what the browser may turn on.
pub(crate) async fn config_descriptor(State(state): State<AppState>) -> Json<ConfigDescriptor> {
    let cfg = &state.config;
    Json(ConfigDescriptor {
        analytics: AnalyticsDescriptor {
            enabled: !cfg.analytics.website_id.is_empty(),
            provider: "umami".into(),
            script_url: cfg.analytics.script_url.clone(),
            website_id: cfg.analytics.website_id.clone(),
        },
        search: SearchDescriptor {
            tavily_enabled: state.search.is_some(),
            max_results: cfg.search.max_results,
        },
        chat: ChatDescriptor {
            sse: true,
            default_model: cfg.chat.default_model.clone(),
        },
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchParams {
    q: Option<String>,
    max: Option<u32>,
}

pub(crate) async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(p): Query<SearchParams>,
) -> Result<Json<SearchResults>, ApiError> {
    let tavily = state.search.clone().ok_or_else(|| RelayError::Unavailable {
        what: state.config.search.api_key_env.clone(),
    })?;
    let q = p
        .q
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| "AI news today".into());
    let rid = request_id(&headers);
    let ctx = RequestCtx::default().with_request_id(rid.as_deref());
    let max = p.max.unwrap_or(state.config.search.max_results);
    Ok(Json(tavily.search(&q, max, &ctx).await?))
}

#[derive(Debug, Deserialize)]
pub(crate) struct LiveNewsParams {
    q: Option<String>,
    max: Option<u32>,
    time_range: Option<String>,
    search_depth: Option<String>,
}

/// `GET /api/news/live`. Auth failures keep their status so the page can
/// tell a bad key from an outage; everything else is a 500.
pub(crate) async fn live_news(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(p): Query<LiveNewsParams>,
) -> Result<Json<LiveNews>, Response> {
    let tavily = state.search.clone().ok_or_else(|| {
        ApiError(RelayError::Unavailable {
            what: state.config.search.api_key_env.clone(),
        })
        .into_response()
    })?;
    let query = NewsQuery::from_parts(&state.config.search, p.q, p.max, p.time_range, p.search_depth);
    let rid = request_id(&headers);
    let ctx = RequestCtx::default().with_request_id(rid.as_deref());
    tavily.live_news(&query, &ctx).await.map(Json).map_err(|e| {
        let status = match e.status() {
            s if s == StatusCode::UNAUTHORIZED || s == StatusCode::FORBIDDEN => s,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(error = %e, status = status.as_u16(), "live news failed");
        error_body(status, &e.to_string())
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct WeeklyParams {
    topic: Option<String>,
    time_range: Option<String>,
}

/// `GET /api/ai-weekly`. When every candidate model fails the body lists them.
pub(crate) async fn ai_weekly(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(p): Query<WeeklyParams>,
) -> Result<Json<WeeklyDigest>, Response> {
    let news = state.news.clone().ok_or_else(|| {
        ApiError(RelayError::Unavailable {
            what: state.config.news.api_key_env.clone(),
        })
        .into_response()
    })?;
    let nonblank = |s: Option<String>, d: &str| s.filter(|v| !v.trim().is_empty()).unwrap_or_else(|| d.to_string());
    let topic = nonblank(p.topic, "ai");
    let time_range = nonblank(p.time_range, "week");
    let rid = request_id(&headers);
    let ctx = RequestCtx::default().with_request_id(rid.as_deref());

    news.digest(&topic, &time_range, &ctx).await.map(Json).map_err(|e| {
        let message = match &e {
            RelayError::ProviderError { message, .. } => message.clone(),
            other => other.to_string(),
        };
        tracing::warn!(error = %message, "ai-weekly failed for every model");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": message, "tried": news.candidates() })),
        )
            .into_response()
    })
}
