use crate::config::ChatCfg;
use crate::model::{
    MAX_MAX_TOKENS, MAX_TEMPERATURE, MIN_MAX_TOKENS, MIN_TEMPERATURE, RawParams, StreamRequest,
};
use unicode_normalization::UnicodeNormalization;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        // Byte Order Mark
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Numbers may arrive as JSON numbers or as numeric strings (query parameters).
fn as_finite_f64(v: &serde_json::Value) -> Option<f64> {
    let n = match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn clamp_max_tokens(raw: Option<&serde_json::Value>, default: u32) -> u32 {
    let n = raw.and_then(as_finite_f64).map(f64::trunc).unwrap_or(default as f64);
    n.clamp(MIN_MAX_TOKENS as f64, MAX_MAX_TOKENS as f64) as u32
}

fn clamp_temperature(raw: Option<&serde_json::Value>, default: f32) -> f32 {
    let t = raw.and_then(as_finite_f64).unwrap_or(default as f64);
    t.clamp(MIN_TEMPERATURE as f64, MAX_TEMPERATURE as f64) as f32
}

/// Configured fallbacks applied when a caller omits or garbles a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&ChatCfg> for RequestDefaults {
    fn from(cfg: &ChatCfg) -> Self {
        Self {
            model: cfg.default_model.clone(),
            max_tokens: cfg.default_max_tokens,
            temperature: cfg.default_temperature,
        }
    }
}

impl RequestDefaults {
    /// Validate and clamp loosely-typed input into a [`StreamRequest`].
    pub fn build(&self, raw: RawParams) -> StreamRequest {
        let model = raw
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.model)
            .to_string();
        let system_prompt = raw
            .system
            .as_deref()
            .map(clean_text)
            .filter(|s| !s.is_empty());
        StreamRequest {
            prompt: raw.prompt.as_deref().map(clean_text).unwrap_or_default(),
            system_prompt,
            model,
            max_tokens: clamp_max_tokens(raw.max_tokens.as_ref(), self.max_tokens),
            temperature: clamp_temperature(raw.temperature.as_ref(), self.temperature),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> RequestDefaults {
        RequestDefaults {
            model: "claude-default".into(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    fn raw(prompt: &str) -> RawParams {
        RawParams {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    #[test]
    fn applies_defaults_when_absent() {
        let req = defaults().build(raw("  Hello world   "));
        assert_eq!(req.prompt, "Hello world");
        assert_eq!(req.model, "claude-default");
        assert_eq!(req.max_tokens, 1024);
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.system_prompt, None);
    }

    #[test]
    fn caps_max_tokens_at_8000() {
        let mut r = raw("hi");
        r.max_tokens = Some(json!(50000));
        assert_eq!(defaults().build(r).max_tokens, 8000);
    }

    #[test]
    fn max_tokens_lower_bound_and_truncation() {
        let mut r = raw("hi");
        r.max_tokens = Some(json!(0));
        assert_eq!(defaults().build(r).max_tokens, 1);

        let mut r = raw("hi");
        r.max_tokens = Some(json!("-20"));
        assert_eq!(defaults().build(r).max_tokens, 1);

        let mut r = raw("hi");
        r.max_tokens = Some(json!(99.9));
        assert_eq!(defaults().build(r).max_tokens, 99);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let mut r = raw("hi");
        r.max_tokens = Some(json!("lots"));
        r.temperature = Some(json!({"x": 1}));
        let req = defaults().build(r);
        assert_eq!(req.max_tokens, 1024);
        assert_eq!(req.temperature, 0.7);

        let mut r = raw("hi");
        r.temperature = Some(json!("NaN"));
        assert_eq!(defaults().build(r).temperature, 0.7);
    }

    #[test]
    fn clamps_temperature() {
        let mut r = raw("hi");
        r.temperature = Some(json!("3.5"));
        assert_eq!(defaults().build(r).temperature, 2.0);

        let mut r = raw("hi");
        r.temperature = Some(json!(-1));
        assert_eq!(defaults().build(r).temperature, 0.0);

        let mut r = raw("hi");
        r.temperature = Some(json!(0));
        assert_eq!(defaults().build(r).temperature, 0.0);
    }

    #[test]
    fn blank_model_and_system_fall_back() {
        let mut r = raw("hi");
        r.model = Some("   ".into());
        r.system = Some(" \r\n ".into());
        let req = defaults().build(r);
        assert_eq!(req.model, "claude-default");
        assert_eq!(req.system_prompt, None);
    }

    #[test]
    fn unicode_nfc_and_crlf_normalization() {
        // "e" + combining acute accent should normalize to "é"
        let req = defaults().build(raw("e\u{301}"));
        assert_eq!(req.prompt, "é");

        let req = defaults().build(raw("\u{FEFF}line1\r\nline2"));
        assert_eq!(req.prompt, "line1\nline2");
    }
}
