use serde::{Deserialize, Serialize};

pub const MIN_MAX_TOKENS: u32 = 1;
pub const MAX_MAX_TOKENS: u32 = 8000;
pub const MIN_TEMPERATURE: f32 = 0.0;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// One user action's worth of model input, already validated and clamped.
/// Build it through [`crate::normalizer::RequestDefaults::build`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Loosely-typed input as it arrives from a query string or JSON body.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RawParams {
    pub prompt: Option<String>,
    pub system: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<serde_json::Value>,
    pub temperature: Option<serde_json::Value>,
}

/// Result of a buffered (non-streaming) model call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Completion {
    pub model: String,
    pub text: String,
    /// Provider usage document, passed through verbatim.
    pub usage: Option<serde_json::Value>,
}

/// Body of `POST /api/claude`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeBody {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<serde_json::Value>,
    #[serde(default)]
    pub temperature: Option<serde_json::Value>,
}

impl From<ClaudeBody> for RawParams {
    fn from(b: ClaudeBody) -> Self {
        Self {
            prompt: b.prompt,
            system: b.system,
            model: b.model,
            max_tokens: b.max_tokens,
            temperature: b.temperature,
        }
    }
}

/// Query string of `GET /chat-sse`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSseQuery {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<String>,
    #[serde(default)]
    pub temperature: Option<String>,
}

impl From<ChatSseQuery> for RawParams {
    fn from(q: ChatSseQuery) -> Self {
        Self {
            prompt: q.message,
            system: q.system_prompt,
            model: q.model,
            max_tokens: q.max_tokens.map(serde_json::Value::String),
            temperature: q.temperature.map(serde_json::Value::String),
        }
    }
}

/// Successful reply of `POST /api/claude`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClaudeReply {
    pub ok: bool,
    pub model: String,
    pub text: String,
    pub usage: Option<serde_json::Value>,
}

impl From<Completion> for ClaudeReply {
    fn from(c: Completion) -> Self {
        Self {
            ok: true,
            model: c.model,
            text: c.text,
            usage: c.usage,
        }
    }
}
