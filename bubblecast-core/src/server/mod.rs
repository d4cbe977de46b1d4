//! HTTP surface: the SSE relay, the buffered chat endpoint and the site's
//! JSON documents, all on one axum router.

mod content;
mod relay;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router, middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{HeaderName, HeaderValue, StatusCode, header};
use serde_json::json;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use crate::{
    config::{Config, Credentials},
    error::{CoreResult, RelayError},
    http_client::HttpClient,
    normalizer::RequestDefaults,
    provider::ChatProvider,
    providers::{anthropic::Anthropic, perplexity::Perplexity, tavily::Tavily},
    rate_limit::{BucketStore, InMemoryBucketStore},
};

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub defaults: Arc<RequestDefaults>,
    /// `None` when no chat credential is configured.
    pub chat: Option<Arc<dyn ChatProvider>>,
    pub search: Option<Arc<Tavily>>,
    pub news: Option<Arc<Perplexity>>,
    pub buckets: Arc<dyn BucketStore>,
}

impl AppState {
    /// Wire providers for every credential that is present.
    pub fn from_config(config: Config, creds: Credentials) -> CoreResult<Self> {
        let http = HttpClient::new(&config.http)?;
        let chat = creds.chat.map(|key| {
            let p = Anthropic::new(http.clone(), key, config.chat.base_url.clone())
                .with_idle_timeout(Duration::from_millis(config.http.idle_timeout_ms));
            Arc::new(p) as Arc<dyn ChatProvider>
        });
        let search = creds
            .search
            .map(|key| Arc::new(Tavily::new(http.clone(), key, config.search.base_url.clone())));
        let news = creds.news.map(|key| {
            Arc::new(Perplexity::new(
                http.clone(),
                key,
                config.news.base_url.clone(),
                config.news.model.clone(),
            ))
        });
        tracing::info!(
            chat = chat.is_some(),
            search = search.is_some(),
            news = news.is_some(),
            "providers configured"
        );
        Ok(Self::new(config, chat, search, news))
    }

    /// State with an in-memory bucket store sized from the config.
    pub fn new(
        config: Config,
        chat: Option<Arc<dyn ChatProvider>>,
        search: Option<Arc<Tavily>>,
        news: Option<Arc<Perplexity>>,
    ) -> Self {
        let buckets = Arc::new(InMemoryBucketStore::from(&config.rate_limit));
        Self {
            defaults: Arc::new(RequestDefaults::from(&config.chat)),
            config: Arc::new(config),
            chat,
            search,
            news,
            buckets,
        }
    }

    pub fn with_buckets(mut self, buckets: Arc<dyn BucketStore>) -> Self {
        self.buckets = buckets;
        self
    }

    fn content_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.server.content_dir)
    }
}

/// JSON error body `{ok:false, error, status}` with the matching status code.
pub(crate) struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, status = status.as_u16(), "request failed");
        }
        error_body(status, &self.0.to_string())
    }
}

pub(crate) fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "ok": false, "error": message, "status": status.as_u16() })),
    )
        .into_response()
}

/// Id assigned by [`SetRequestIdLayer`], forwarded upstream.
pub(crate) fn request_id(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("x-content-type-options", "nosniff"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "cross-origin"),
    ("permissions-policy", "camera=(), microphone=(), geolocation=()"),
];

/// Build the full router. Rate limiting guards `/chat-sse` only.
pub fn router(state: AppState) -> Router {
    let relay_routes = Router::new()
        .route("/chat-sse", get(relay::chat_sse))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            relay::rate_limit,
        ));

    let mut app = Router::new()
        .merge(relay_routes)
        .route("/api/claude", post(relay::claude))
        .route("/api/config", get(content::config_descriptor))
        .route("/healthz", get(content::healthz))
        .route("/api/news", get(content::news))
        .route("/api/daily", get(content::daily))
        .route("/api/models", get(content::models))
        .route("/api/rubrics", get(content::rubrics))
        .route("/api/prompts/top", get(content::top_prompts))
        .route("/api/search", get(content::search))
        .route("/api/news/live", get(content::live_news))
        .route("/api/ai-weekly", get(content::ai_weekly))
        .with_state(state);

    for (name, value) in SECURITY_HEADERS {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }

    // last layer added runs first
    app.layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Bind and serve until Ctrl-C or SIGTERM.
pub async fn serve(state: AppState) -> CoreResult<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "shutting down"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "shutting down"),
    }
}

/// Header name for the SSE proxy-buffering opt-out.
pub(crate) const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub(crate) fn sse_cache_control() -> (HeaderName, HeaderValue) {
    (
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    pub(crate) fn bare_state() -> AppState {
        AppState::new(Config::default(), None, None, None)
    }

    #[tokio::test]
    async fn responses_carry_request_id_and_security_headers() {
        let resp = router(bare_state())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let h = resp.headers();
        let rid = h.get("x-request-id").unwrap().to_str().unwrap();
        assert_eq!(rid.len(), 36);
        assert_eq!(h.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(h.get("cross-origin-opener-policy").unwrap(), "same-origin");
    }

    #[tokio::test]
    async fn inbound_request_id_is_kept() {
        let resp = router(bare_state())
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "abc-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "abc-1");
    }

    #[test]
    fn api_error_body_shape() {
        let resp = ApiError(RelayError::Validation("bad".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
