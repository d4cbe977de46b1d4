use serde::Serialize;

/// How an upstream stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminal {
    Done,
    Error,
}

/// Structured summary of one relayed upstream stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamLog {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub latency_ms: Option<u64>,

    /// Number of `Delta` frames forwarded.
    pub deltas: u32,
    /// Interior frames dropped because their JSON did not parse.
    pub dropped_frames: u32,

    pub terminal: Option<Terminal>,
    pub error_message: Option<String>,
}

impl StreamLog {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn provider(mut self, v: &str) -> Self {
        self.provider = Some(v.to_string());
        self
    }
    pub fn model(mut self, v: &str) -> Self {
        self.model = Some(v.to_string());
        self
    }
    pub fn request_id_opt(mut self, v: Option<&str>) -> Self {
        self.request_id = v.map(|s| s.to_string());
        self
    }
    pub fn latency_ms(mut self, v: u64) -> Self {
        self.latency_ms = Some(v);
        self
    }
    pub fn counts(mut self, deltas: u32, dropped: u32) -> Self {
        self.deltas = deltas;
        self.dropped_frames = dropped;
        self
    }
    pub fn terminal(mut self, t: Terminal) -> Self {
        self.terminal = Some(t);
        self
    }
    pub fn error_message_opt(mut self, v: Option<&str>) -> Self {
        self.error_message = v.map(|s| s.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_log_serializes() {
        let log = StreamLog::new()
            .provider("anthropic")
            .model("claude-3-haiku")
            .request_id_opt(Some("req-abc"))
            .latency_ms(42)
            .counts(3, 1)
            .terminal(Terminal::Done);

        let as_json = serde_json::to_value(&log).unwrap();
        assert_eq!(as_json["provider"], json!("anthropic"));
        assert_eq!(as_json["model"], json!("claude-3-haiku"));
        assert_eq!(as_json["deltas"], json!(3));
        assert_eq!(as_json["dropped_frames"], json!(1));
        assert_eq!(as_json["terminal"], json!("done"));
        assert_eq!(as_json["error_message"], json!(null));
    }
}
