use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};

/// Request context carries the provider label and the inbound request id.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    /// Label used in errors and logs (defaults to "http").
    pub provider: Option<&'a str>,
    /// Propagated upstream as `X-Request-Id`.
    pub request_id: Option<&'a str>,
}

impl<'a> RequestCtx<'a> {
    pub fn provider(provider: &'a str) -> Self {
        Self {
            provider: Some(provider),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, rid: Option<&'a str>) -> Self {
        self.request_id = rid;
        self
    }

    fn label(&self) -> &'a str {
        self.provider.unwrap_or("http")
    }
}

/// A boxed stream of raw body chunks.
pub type ByteStream = std::pin::Pin<
    Box<dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        // No client-wide total timeout: streams may legitimately run for minutes.
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("bubblecast/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn decorate(&self, mut req: RequestBuilder, headers: &[(&str, &str)], ctx: &RequestCtx<'_>) -> RequestBuilder {
        req = req.header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        req
    }

    /// POST JSON and decode a JSON reply. Returns the body, the provider's
    /// request id (if any) and the latency in milliseconds.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let req = self
            .inner
            .post(url)
            .json(body)
            .timeout(self.request_timeout);
        self.send_json(self.decorate(req, headers, ctx), ctx).await
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let req = self.inner.get(url).timeout(self.request_timeout);
        self.send_json(self.decorate(req, headers, ctx), ctx).await
    }

    async fn send_json<R: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let provider = ctx.label();
        let resp = req
            .send()
            .await
            .map_err(|_e| RelayError::ProviderUnavailable {
                provider: provider.into(),
            })?;

        let latency = start.elapsed().as_millis() as u32;
        let status = resp.status();
        let headers = resp.headers().clone();
        let provider_request_id = extract_request_id(&headers);

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let ra = parse_retry_after(&headers);
            return Err(map_http_error(provider, status, ra, &text));
        }

        let parsed = resp
            .json::<R>()
            .await
            .map_err(|e| RelayError::ProviderError {
                provider: provider.into(),
                code: status.as_u16().to_string(),
                message: format!("json decode error: {e}"),
            })?;
        Ok((parsed, provider_request_id, latency))
    }

    /// POST JSON and return the raw chunked body of an event stream.
    /// Non-2xx responses are mapped to errors before any byte is read.
    pub async fn post_event_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let req = self
            .inner
            .post(url)
            .json(body)
            .header("Accept", "text/event-stream");
        self.open_stream(self.decorate(req, headers, ctx), ctx).await
    }

    /// GET an event stream (used by the stream consumer).
    pub async fn get_event_stream(
        &self,
        url: &str,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let req = self
            .inner
            .get(url)
            .header("Accept", "text/event-stream");
        self.open_stream(self.decorate(req, &[], ctx), ctx).await
    }

    async fn open_stream(&self, req: RequestBuilder, ctx: &RequestCtx<'_>) -> CoreResult<ByteStream> {
        let provider = ctx.label();
        let resp = req.send().await.map_err(|_| RelayError::ProviderUnavailable {
            provider: provider.into(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(provider, status, ra, &body));
        }
        Ok(Box::pin(resp.bytes_stream()))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["request-id", "x-request-id", "x-amzn-requestid"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

pub(crate) fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => RelayError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => RelayError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
