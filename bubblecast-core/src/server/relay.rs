use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    extract::{ConnectInfo, Query, Request, State},
    middleware::Next,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::stream::{self, Stream, StreamExt};
use http::{HeaderMap, HeaderValue};
use serde_json::json;
use tokio::sync::mpsc;

use super::{ApiError, AppState, X_ACCEL_BUFFERING, request_id, sse_cache_control};
use crate::{
    error::RelayError,
    http_client::RequestCtx,
    model::{ChatSseQuery, ClaudeBody, ClaudeReply, StreamRequest},
    provider::ChatProvider,
    rate_limit::client_identity,
    stream::NormalizedFrame,
};

/// Frames buffered between the upstream reader and the client writer.
const RELAY_BUFFER: usize = 32;

/// Token-bucket gate in front of the relay.
pub(crate) async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let identity = client_identity(request.headers(), peer);
    if !state.buckets.admit(&identity, Instant::now()) {
        let err = RelayError::Throttled { identity };
        tracing::info!(error = %err, "rejected by rate limiter");
        return (
            err.status(),
            Json(json!({ "ok": false, "error": err.to_string() })),
        )
            .into_response();
    }
    next.run(request).await
}

/// `GET /chat-sse`: relay one model answer as normalized SSE frames.
pub(crate) async fn chat_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChatSseQuery>,
) -> Response {
    let Some(chat) = state.chat.clone() else {
        let err = missing_chat_key(&state);
        tracing::warn!(error = %err, "chat-sse without credential");
        return sse_response(stream::iter([NormalizedFrame::error(err.to_string())]));
    };

    let req = state.defaults.build(query.into());
    let rid = request_id(&headers);
    tracing::info!(
        model = %req.model,
        max_tokens = req.max_tokens,
        temperature = req.temperature,
        request_id = rid.as_deref().unwrap_or_default(),
        "chat-sse opened"
    );

    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    tokio::spawn(pump(chat, req, rid, tx));

    let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) });
    sse_response(frames)
}

/// Drive the upstream stream into the client channel. Stops after the first
/// terminal frame and drops the upstream as soon as the client goes away.
async fn pump(
    chat: Arc<dyn ChatProvider>,
    req: StreamRequest,
    rid: Option<String>,
    tx: mpsc::Sender<NormalizedFrame>,
) {
    let ctx = RequestCtx::default().with_request_id(rid.as_deref());
    let forward = async {
        let mut frames = chat.open_stream(&req, &ctx).await;
        while let Some(frame) = frames.next().await {
            let terminal = frame.is_terminal();
            if tx.send(frame).await.is_err() || terminal {
                return;
            }
        }
        let _ = tx
            .send(NormalizedFrame::error("upstream ended without a terminal frame"))
            .await;
    };

    tokio::select! {
        _ = forward => {}
        _ = tx.closed() => {
            tracing::info!(request_id = rid.as_deref().unwrap_or_default(), "client disconnected, upstream dropped");
        }
    }
}

fn sse_response<S>(frames: S) -> Response
where
    S: Stream<Item = NormalizedFrame> + Send + 'static,
{
    let events = frames.map(|f| Ok::<_, Infallible>(Event::default().data(f.to_json())));
    let mut resp = Sse::new(events).into_response();
    let (name, value) = sse_cache_control();
    let h = resp.headers_mut();
    h.insert(name, value);
    h.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    resp
}

fn missing_chat_key(state: &AppState) -> RelayError {
    RelayError::Unavailable {
        what: state
            .config
            .chat
            .api_key_envs
            .first()
            .cloned()
            .unwrap_or_else(|| "chat API key".into()),
    }
}

/// `POST /api/claude`: one buffered completion.
pub(crate) async fn claude(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ClaudeBody>,
) -> Result<Json<ClaudeReply>, ApiError> {
    let chat = state.chat.clone().ok_or_else(|| missing_chat_key(&state))?;
    let req = state.defaults.build(body.into());
    let rid = request_id(&headers);
    let ctx = RequestCtx::default().with_request_id(rid.as_deref());
    let completion = chat.complete(&req, &ctx).await?;
    Ok(Json(completion.into()))
}
