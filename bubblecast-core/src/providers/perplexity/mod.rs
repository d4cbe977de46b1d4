use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    error::{CoreResult, RelayError},
    http_client::{HttpClient, RequestCtx},
};

/// Tried in order after the configured model.
pub const FALLBACK_MODELS: [&str; 5] = ["sonar-pro", "sonar", "sonar-small", "sonar-medium", "sonar-large"];

const DAY_TTL: Duration = Duration::from_secs(15 * 60);
const WEEK_TTL: Duration = Duration::from_secs(6 * 60 * 60);

static BAD_MODEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)invalid model|field required").expect("Invalid regex"));

fn is_bad_model(message: &str) -> bool {
    BAD_MODEL.is_match(message)
}

fn ttl_for(time_range: &str) -> Duration {
    if time_range == "day" { DAY_TTL } else { WEEK_TTL }
}

/// Curated AI digest (Perplexity chat completions with a JSON schema).
#[derive(Debug)]
pub struct Perplexity {
    http: HttpClient,
    api_key: SecretString,
    base: String,
    name: String,
    preferred: Option<String>,
    cache: DashMap<String, (Instant, WeeklyDigest)>,
}

impl Perplexity {
    pub fn new(http: HttpClient, api_key: SecretString, base: String, preferred: Option<String>) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            name: "perplexity".into(),
            preferred: preferred.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()),
            cache: DashMap::new(),
        }
    }

    /// Models in the order they are tried.
    pub fn candidates(&self) -> Vec<String> {
        self.preferred
            .iter()
            .cloned()
            .chain(FALLBACK_MODELS.iter().map(|m| m.to_string()))
            .collect()
    }

    /// Digest for `topic` over `time_range`; served from cache while fresh.
    /// Each candidate model is tried until one answers.
    pub async fn digest(&self, topic: &str, time_range: &str, ctx: &RequestCtx<'_>) -> CoreResult<WeeklyDigest> {
        let candidates = self.candidates();
        let key = format!("{topic}:{time_range}:{}", candidates.join("|"));
        let ttl = ttl_for(time_range);

        let fresh = self
            .cache
            .get(&key)
            .filter(|hit| hit.0.elapsed() < ttl)
            .map(|hit| hit.1.clone());
        if let Some(digest) = fresh {
            tracing::debug!(topic, time_range, "digest cache hit");
            return Ok(digest);
        }

        let ctx = RequestCtx {
            provider: Some(&self.name),
            ..*ctx
        };
        let mut last_err = None;
        for model in &candidates {
            match self.ask_model(model, topic, time_range, &ctx).await {
                Ok(items) => {
                    let out = WeeklyDigest {
                        ok: true,
                        topic: topic.to_string(),
                        time_range: time_range.to_string(),
                        model_used: model.clone(),
                        items,
                    };
                    let now = Instant::now();
                    self.prune(now);
                    self.cache.insert(key, (now, out.clone()));
                    return Ok(out);
                }
                Err(RelayError::ProviderError { code, message, .. })
                    if code == "400" && is_bad_model(&message) =>
                {
                    tracing::warn!(model = %model, "bad model, trying next");
                    last_err = Some(format!("bad_model {model}"));
                }
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "digest attempt failed");
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(RelayError::ProviderError {
            provider: self.name.clone(),
            code: "500".into(),
            message: last_err.unwrap_or_else(|| "Perplexity failed for all candidates".into()),
        })
    }

    /// Drop every cached digest that has outlived its time range's TTL.
    fn prune(&self, now: Instant) {
        self.cache
            .retain(|_, (at, digest)| now.saturating_duration_since(*at) < ttl_for(&digest.time_range));
    }

    async fn ask_model(
        &self,
        model: &str,
        topic: &str,
        time_range: &str,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<Vec<DigestItem>> {
        let payload = PChatReq {
            model,
            messages: vec![
                PMessage {
                    role: "system",
                    content: "You are an impartial AI news analyst. Return structured JSON only.".into(),
                },
                PMessage {
                    role: "user",
                    content: user_prompt(topic, time_range),
                },
            ],
            max_tokens: 1200,
            temperature: 0.2,
            response_format: json!({ "type": "json_schema", "json_schema": { "schema": item_schema() } }),
        };
        let auth = format!("Bearer {}", self.api_key.expose_secret());
        let headers = [("Authorization", auth.as_str()), ("Accept", "application/json")];
        let (resp, _, latency_ms) = self
            .http
            .post_json::<_, PChatResp>(&format!("{}/chat/completions", self.base), &payload, &headers, ctx)
            .await?;
        tracing::info!(provider = %self.name, model, latency_ms, "digest");

        let content = resp
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("{}");
        // Unparseable content still counts as an answer, just an empty one.
        let parsed: PItems = serde_json::from_str(content).unwrap_or_default();
        Ok(parsed.items.into_iter().map(DigestItem::from).collect())
    }
}

fn user_prompt(topic: &str, time_range: &str) -> String {
    let span = if time_range == "day" { "daily" } else { "weekly" };
    let subject = if topic == "security" {
        "AI security and policy advisories, safety incidents, critical patches, misuse warnings, model risks"
    } else {
        "AI/LLM industry"
    };
    format!(
        "Collect the most relevant {span} {subject} items from trusted sources.\n\
Return 8-16 items. Each item as: title, url, summary (1-2 sentences), severity (low/med/high for security; else empty), \
tag (e.g., model, product, research, policy, security), published_time (ISO if available)."
    )
}

fn item_schema() -> serde_json::Value {
    let s = json!({ "type": "string" });
    json!({
        "type": "object",
        "properties": { "items": {
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "title": s, "url": s, "summary": s,
                    "severity": s, "tag": s, "published_time": s
                },
                "required": ["title", "url", "summary"]
            }
        }},
        "required": ["items"]
    })
}

#[derive(Serialize)]
struct PChatReq<'a> {
    model: &'a str,
    messages: Vec<PMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    response_format: serde_json::Value,
}

#[derive(Serialize)]
struct PMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct PChatResp {
    #[serde(default)]
    choices: Vec<PChoice>,
}

#[derive(Deserialize)]
struct PChoice {
    message: PChoiceMsg,
}

#[derive(Deserialize)]
struct PChoiceMsg {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct PItems {
    #[serde(default)]
    items: Vec<PItem>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PItem {
    title: Option<String>,
    url: Option<String>,
    summary: Option<String>,
    severity: Option<String>,
    tag: Option<String>,
    published_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigestItem {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub severity: String,
    pub tag: String,
    pub published_time: Option<String>,
}

impl From<PItem> for DigestItem {
    fn from(it: PItem) -> Self {
        let nonempty = |s: Option<String>| s.filter(|v| !v.is_empty());
        Self {
            title: nonempty(it.title).unwrap_or_else(|| "Untitled".into()),
            url: nonempty(it.url).unwrap_or_else(|| "#".into()),
            snippet: it.summary.unwrap_or_default(),
            severity: it.severity.unwrap_or_default(),
            tag: it.tag.unwrap_or_default(),
            published_time: nonempty(it.published_time),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeeklyDigest {
    pub ok: bool,
    pub topic: String,
    pub time_range: String,
    pub model_used: String,
    pub items: Vec<DigestItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(base: String, preferred: Option<&str>) -> Perplexity {
        Perplexity::new(
            HttpClient::new_default().unwrap(),
            SecretString::from("pp-key".to_string()),
            base,
            preferred.map(str::to_string),
        )
    }

    fn answer(content: &str) -> serde_json::Value {
        json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
    }

    #[test]
    fn candidate_order() {
        let p = client("http://x".into(), Some(" sonar-reasoning "));
        assert_eq!(
            p.candidates(),
            vec!["sonar-reasoning", "sonar-pro", "sonar", "sonar-small", "sonar-medium", "sonar-large"]
        );
        let p = client("http://x".into(), Some(""));
        assert_eq!(p.candidates().first().map(String::as_str), Some("sonar-pro"));
    }

    #[tokio::test]
    async fn falls_through_bad_model_and_caches() {
        let server = MockServer::start_async().await;
        let bad = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("Authorization", "Bearer pp-key")
                    .json_body_partial(r#"{"model":"sonar-pro"}"#);
                then.status(400)
                    .json_body(json!({"error": {"message": "Invalid model 'sonar-pro'"}}));
            })
            .await;
        let good = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .json_body_partial(r#"{"model":"sonar","max_tokens":1200}"#);
                then.status(200).json_body(answer(
                    r#"{"items":[{"title":"GPT-9","url":"https://n","summary":"big","tag":"model"},{"title":""}]}"#,
                ));
            })
            .await;

        let p = client(server.base_url(), None);
        let d = p.digest("ai", "week", &RequestCtx::default()).await.unwrap();
        assert_eq!(d.model_used, "sonar");
        assert_eq!(d.items.len(), 2);
        assert_eq!(d.items[0].snippet, "big");
        assert_eq!(d.items[1].title, "Untitled");
        assert_eq!(d.items[1].url, "#");

        let again = p.digest("ai", "week", &RequestCtx::default()).await.unwrap();
        assert_eq!(again, d);
        assert_eq!(bad.hits_async().await, 1);
        assert_eq!(good.hits_async().await, 1);
    }

    #[test]
    fn bad_model_detection_ignores_case() {
        assert!(is_bad_model(r#"{"error":{"message":"Invalid model 'x'"}}"#));
        assert!(is_bad_model("messages: FIELD REQUIRED"));
        assert!(!is_bad_model("quota exceeded"));
    }

    #[tokio::test]
    async fn expired_digests_are_pruned() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(answer(r#"{"items":[]}"#));
            })
            .await;
        let p = client(server.base_url(), Some("sonar"));
        for topic in ["a", "b", "c"] {
            p.digest(topic, "day", &RequestCtx::default()).await.unwrap();
        }
        p.digest("ai", "week", &RequestCtx::default()).await.unwrap();
        assert_eq!(p.cache.len(), 4);

        p.prune(Instant::now() + DAY_TTL + Duration::from_secs(1));
        assert_eq!(p.cache.len(), 1);
        p.prune(Instant::now() + WEEK_TTL + Duration::from_secs(1));
        assert!(p.cache.is_empty());
    }

    #[tokio::test]
    async fn unparseable_content_is_empty_digest() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(answer("not json at all"));
            })
            .await;
        let d = client(server.base_url(), Some("sonar"))
            .digest("security", "day", &RequestCtx::default())
            .await
            .unwrap();
        assert!(d.ok);
        assert!(d.items.is_empty());
        assert_eq!(d.time_range, "day");
    }

    #[tokio::test]
    async fn all_candidates_failing_is_500() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(503);
            })
            .await;
        let p = client(server.base_url(), None);
        let err = p.digest("ai", "week", &RequestCtx::default()).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(m.hits_async().await, FALLBACK_MODELS.len());
    }
}
