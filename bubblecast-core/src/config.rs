use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerCfg {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding the static JSON content documents (news.json, models.json, ...).
    #[serde(default = "default_content_dir")]
    pub content_dir: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            content_dir: default_content_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_content_dir() -> String {
    "api".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatCfg {
    /// Environment variables checked in order for the model provider key.
    #[serde(default = "default_chat_key_envs")]
    pub api_key_envs: Vec<String>,
    #[serde(default = "default_chat_base")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,
}

impl Default for ChatCfg {
    fn default() -> Self {
        Self {
            api_key_envs: default_chat_key_envs(),
            base_url: default_chat_base(),
            default_model: default_model(),
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
        }
    }
}

fn default_chat_key_envs() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".into(), "CLAUDE_API_KEY".into()]
}
fn default_chat_base() -> String {
    "https://api.anthropic.com".into()
}
fn default_model() -> String {
    DEFAULT_MODEL.into()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SearchCfg {
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_search_base")]
    pub base_url: String,
    #[serde(default = "default_search_max")]
    pub max_results: u32,
    #[serde(default = "default_news_query")]
    pub news_query: String,
    #[serde(default = "default_news_max")]
    pub news_max_results: u32,
    #[serde(default = "default_time_range")]
    pub time_range: String,
    #[serde(default = "default_search_depth")]
    pub search_depth: String,
}

impl Default for SearchCfg {
    fn default() -> Self {
        Self {
            api_key_env: default_search_key_env(),
            base_url: default_search_base(),
            max_results: default_search_max(),
            news_query: default_news_query(),
            news_max_results: default_news_max(),
            time_range: default_time_range(),
            search_depth: default_search_depth(),
        }
    }
}

fn default_search_key_env() -> String {
    "TAVILY_API_KEY".into()
}
fn default_search_base() -> String {
    "https://api.tavily.com".into()
}
fn default_search_max() -> u32 {
    7
}
fn default_news_query() -> String {
    r#"("Künstliche Intelligenz" OR AI OR LLM OR "machine learning" OR "Generative AI" OR OpenAI OR Anthropic OR Google OR Meta OR HuggingFace) -job -jobs -hiring -recruiter -remote"#.into()
}
fn default_news_max() -> u32 {
    18
}
fn default_time_range() -> String {
    "day".into()
}
fn default_search_depth() -> String {
    "basic".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewsCfg {
    #[serde(default = "default_news_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_news_base")]
    pub base_url: String,
    /// Preferred model; tried before the built-in candidates.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for NewsCfg {
    fn default() -> Self {
        Self {
            api_key_env: default_news_key_env(),
            base_url: default_news_base(),
            model: None,
        }
    }
}

fn default_news_key_env() -> String {
    "PERPLEXITY_API_KEY".into()
}
fn default_news_base() -> String {
    "https://api.perplexity.ai".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RateLimitCfg {
    /// Bucket size (burst).
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// One token is added per elapsed interval.
    #[serde(default = "default_refill_ms")]
    pub refill_interval_ms: u64,
}

impl Default for RateLimitCfg {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_interval_ms: default_refill_ms(),
        }
    }
}

fn default_capacity() -> u32 {
    10
}
fn default_refill_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total timeout for buffered (non-streaming) requests in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Abort an upstream stream after this long without bytes (default 45000ms)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_idle_timeout_ms() -> u64 {
    45_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AnalyticsCfg {
    #[serde(default)]
    pub website_id: String,
    #[serde(default = "default_script_url")]
    pub script_url: String,
}

impl Default for AnalyticsCfg {
    fn default() -> Self {
        Self {
            website_id: String::new(),
            script_url: default_script_url(),
        }
    }
}

fn default_script_url() -> String {
    "https://analytics.umami.is/script.js".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub chat: ChatCfg,
    #[serde(default)]
    pub search: SearchCfg,
    #[serde(default)]
    pub news: NewsCfg,
    #[serde(default)]
    pub rate_limit: RateLimitCfg,
    /// HTTP client configuration (timeouts, pooling). Missing in older configs → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub analytics: AnalyticsCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::RelayError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::RelayError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }

    /// Overlay environment-style inputs. Unparsable numeric values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(model) = get("CLAUDE_MODEL") {
            self.chat.default_model = model;
        }
        if let Some(base) = get("ANTHROPIC_BASE_URL") {
            self.chat.base_url = base;
        }
        if let Some(max) = get("TAVILY_MAX_RESULTS").and_then(|v| v.parse().ok()) {
            self.search.max_results = max;
            self.search.news_max_results = max;
        }
        if let Some(q) = get("TAVILY_QUERY") {
            self.search.news_query = q;
        }
        if let Some(r) = get("TAVILY_TIME_RANGE") {
            self.search.time_range = r;
        }
        if let Some(d) = get("TAVILY_SEARCH_DEPTH") {
            self.search.search_depth = d;
        }
        if let Some(m) = get("PERPLEXITY_MODEL") {
            self.news.model = Some(m);
        }
        if let Some(id) = get("UMAMI_WEBSITE_ID") {
            self.analytics.website_id = id;
        }
        if let Some(url) = get("UMAMI_SCRIPT_URL") {
            self.analytics.script_url = url;
        }
    }
}

/// Upstream credentials, resolved once at startup and immutable afterwards.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub chat: Option<SecretString>,
    pub search: Option<SecretString>,
    pub news: Option<SecretString>,
}

impl Credentials {
    pub fn resolve<F>(cfg: &Config, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(SecretString::from)
        };
        Self {
            chat: cfg.chat.api_key_envs.iter().find_map(|n| secret(n)),
            search: secret(&cfg.search.api_key_env),
            news: secret(&cfg.news.api_key_env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_reference_site() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.chat.default_model, DEFAULT_MODEL);
        assert_eq!(cfg.chat.default_max_tokens, 1024);
        assert_eq!(cfg.rate_limit.capacity, 10);
        assert_eq!(cfg.rate_limit.refill_interval_ms, 5_000);
        assert_eq!(cfg.search.max_results, 7);
        assert_eq!(cfg.http.idle_timeout_ms, 45_000);
    }

    #[test]
    fn load_from_json() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("site.json");
        let json = r#"{
          "server": {"port": 9090, "content_dir": "content"},
          "chat": {"default_model": "claude-3-haiku", "default_temperature": 0.2},
          "rate_limit": {"capacity": 3}
        }"#;
        fs::write(&file, json).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.content_dir, "content");
        assert_eq!(cfg.chat.default_model, "claude-3-haiku");
        assert_eq!(cfg.chat.default_max_tokens, 1024);
        assert_eq!(cfg.rate_limit.capacity, 3);
        assert_eq!(cfg.rate_limit.refill_interval_ms, 5_000);
        assert_eq!(cfg.http.connect_timeout_ms, 5_000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
        assert_eq!(cfg.http.pool_max_idle_per_host, None);
    }

    #[test]
    fn load_from_toml() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("site.toml");
        let toml = r#"
[server]
host = "127.0.0.1"

[chat]
api_key_envs = ["MY_KEY"]
base_url = "http://localhost:9999"

[news]
model = "sonar"

[http]
idle_timeout_ms = 1000
"#;
        fs::write(&file, toml).unwrap();
        let cfg = Config::from_path(&file).unwrap();
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.chat.api_key_envs, vec!["MY_KEY".to_string()]);
        assert_eq!(cfg.chat.base_url, "http://localhost:9999");
        assert_eq!(cfg.news.model.as_deref(), Some("sonar"));
        assert_eq!(cfg.http.idle_timeout_ms, 1000);
        assert_eq!(cfg.http.request_timeout_ms, 60_000);
    }

    #[test]
    fn missing_file_returns_io_error() {
        let missing = std::path::PathBuf::from("/definitely/not/here/bubblecast-missing.json");
        let err = Config::from_path(&missing).unwrap_err();
        match err {
            crate::error::RelayError::Io(_) => {}
            other => panic!("expected Io error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_utf8_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.bin");
        fs::write(&file, vec![0xff, 0xfe, 0xfd, 0x00, 0x80]).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        match err {
            crate::error::RelayError::Other(_) => {}
            other => panic!("expected Other(utf8) error, got: {:?}", other),
        }
    }

    #[test]
    fn bad_json_returns_other_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        fs::write(&file, r#"{ "server": { "port": "not-a-port" }"#).unwrap();
        let err = Config::from_path(&file).unwrap_err();
        match err {
            crate::error::RelayError::Other(_) => {}
            other => panic!("expected Other(json parse) error, got: {:?}", other),
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_json_then_toml() {
        let dir = tempdir().unwrap();
        let json_path = dir.path().join("site.conf");
        fs::write(&json_path, r#"{"server":{"port":1234}}"#).unwrap();
        assert_eq!(Config::from_path(&json_path).unwrap().server.port, 1234);

        let toml_path = dir.path().join("site2.conf");
        fs::write(&toml_path, "[server]\nport = 4321\n").unwrap();
        assert_eq!(Config::from_path(&toml_path).unwrap().server.port, 4321);
    }

    #[test]
    fn env_overlay() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("PORT", "3000"),
            ("CLAUDE_MODEL", " claude-3-opus "),
            ("TAVILY_MAX_RESULTS", "nope"),
            ("PERPLEXITY_MODEL", "sonar-pro"),
            ("UMAMI_WEBSITE_ID", ""),
        ]));
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.chat.default_model, "claude-3-opus");
        assert_eq!(cfg.search.max_results, 7);
        assert_eq!(cfg.news.model.as_deref(), Some("sonar-pro"));
        assert_eq!(cfg.analytics.website_id, "");
    }

    #[test]
    fn credentials_fall_back_and_ignore_blank() {
        let cfg = Config::default();
        let creds = Credentials::resolve(
            &cfg,
            env(&[
                ("ANTHROPIC_API_KEY", "  "),
                ("CLAUDE_API_KEY", "sk-fallback"),
                ("TAVILY_API_KEY", "tv-1"),
            ]),
        );
        assert_eq!(
            creds.chat.as_ref().map(|s| s.expose_secret().to_string()),
            Some("sk-fallback".into())
        );
        assert!(creds.search.is_some());
        assert!(creds.news.is_none());
    }
}
