mod stream;

pub use stream::{StreamMeta, normalize_events};

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CoreResult, RelayError},
    http_client::{HttpClient, RequestCtx},
    model::{Completion, StreamRequest},
    provider::ChatProvider,
    stream::FrameStream,
};

/// Default Anthropic API version header required by the Messages API.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct Anthropic {
    http: HttpClient,
    api_key: SecretString,
    base: String,
    name: String,
    idle_timeout: Duration,
}

impl Anthropic {
    pub fn new(http: HttpClient, api_key: SecretString, base: String) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            name: "anthropic".into(),
            idle_timeout: Duration::from_secs(45),
        }
    }

    /// Abort a stream after this long without upstream bytes.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "x-api-key".to_string(),
                self.api_key.expose_secret().to_string(),
            ),
            (
                "anthropic-version".to_string(),
                ANTHROPIC_API_VERSION.to_string(),
            ),
        ]
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base)
    }
}

// ===== Anthropic wire types (Messages API) =====

#[derive(Serialize)]
struct AMsgReq<'a> {
    model: &'a str,
    messages: Vec<AMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> AMsgReq<'a> {
    fn from_request(req: &'a StreamRequest, stream: bool) -> Self {
        Self {
            model: &req.model,
            messages: vec![AMessage {
                role: "user",
                content: vec![AContent::Text { text: &req.prompt }],
            }],
            system: req.system_prompt.as_deref(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream,
        }
    }
}

#[derive(Serialize)]
struct AMessage<'a> {
    role: &'a str,
    content: Vec<AContent<'a>>, // Anthropic accepts an array of content blocks
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AContent<'a> {
    Text { text: &'a str },
}

#[derive(Deserialize)]
struct AMsgResp {
    #[serde(default)]
    content: Vec<ARespContent>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ARespContent {
    r#type: String,
    text: Option<String>,
}

#[async_trait]
impl ChatProvider for Anthropic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: &StreamRequest, ctx: &RequestCtx<'_>) -> CoreResult<Completion> {
        let payload = AMsgReq::from_request(req, false);
        let headers = self.headers();
        let header_pairs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let ctx = RequestCtx {
            provider: Some(&self.name),
            ..*ctx
        };

        let (resp, provider_request_id, latency_ms) = self
            .http
            .post_json::<_, AMsgResp>(&self.url(), &payload, &header_pairs, &ctx)
            .await?;

        let text: String = resp
            .content
            .iter()
            .filter(|c| c.r#type == "text")
            .filter_map(|c| c.text.as_deref())
            .collect();

        tracing::info!(
            provider = %self.name,
            model = %req.model,
            latency_ms,
            provider_request_id = provider_request_id.as_deref().unwrap_or_default(),
            chars = text.len(),
            "buffered completion"
        );

        Ok(Completion {
            model: req.model.clone(),
            text,
            usage: resp.usage,
        })
    }

    async fn open_stream(&self, req: &StreamRequest, ctx: &RequestCtx<'_>) -> FrameStream {
        let meta = StreamMeta {
            provider: self.name.clone(),
            model: req.model.clone(),
            request_id: ctx.request_id.map(str::to_string),
            idle_timeout: self.idle_timeout,
        };
        let payload = AMsgReq::from_request(req, true);
        let headers = self.headers();
        let header_pairs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let ctx = RequestCtx {
            provider: Some(&self.name),
            ..*ctx
        };

        // Waiting for response headers (or an error body) counts as idle time.
        let opened = tokio::time::timeout(
            self.idle_timeout,
            self.http
                .post_event_stream(&self.url(), &payload, &header_pairs, &ctx),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RelayError::IdleTimeout {
                provider: self.name.clone(),
                secs: self.idle_timeout.as_secs(),
            })
        });
        match opened {
            Ok(body) => normalize_events(body, meta),
            Err(e) => stream::failed(&meta, &e),
        }
    }
}
