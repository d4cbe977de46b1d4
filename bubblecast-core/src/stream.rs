//! The normalized frame protocol shared by the relay and the stream consumer.
//!
//! Contract:
//! - A stream carries 0..n `Delta` frames followed by exactly one terminal frame:
//!   `Done` or `Error`.
//! - After a terminal frame, no further frames are emitted.
//!
//! On the wire each frame is one JSON object: `{"delta":"..."}`, `{"done":true}`
//! or `{"error":"..."}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireFrame", try_from = "WireFrame")]
pub enum NormalizedFrame {
    /// Incremental answer text.
    Delta { text: String },
    /// The upstream finished normally.
    Done,
    /// The stream failed; nothing follows.
    Error { message: String },
}

impl NormalizedFrame {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns true if this frame terminates the stream (`Done` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Convenience accessor for `Delta` contents.
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::Delta { text } => Some(text.as_str()),
            _ => None,
        }
    }

    /// Serialized JSON object for this frame.
    pub fn to_json(&self) -> String {
        // WireFrame only holds strings and a bool; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"frame encoding failed"}"#.into())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<NormalizedFrame> for WireFrame {
    fn from(frame: NormalizedFrame) -> Self {
        match frame {
            NormalizedFrame::Delta { text } => Self {
                delta: Some(text),
                ..Default::default()
            },
            NormalizedFrame::Done => Self {
                done: true,
                ..Default::default()
            },
            NormalizedFrame::Error { message } => Self {
                error: Some(message),
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireFrame> for NormalizedFrame {
    type Error = String;

    fn try_from(w: WireFrame) -> Result<Self, String> {
        if let Some(text) = w.delta {
            Ok(Self::Delta { text })
        } else if w.done {
            Ok(Self::Done)
        } else if let Some(message) = w.error {
            Ok(NormalizedFrame::Error { message })
        } else {
            Err("frame carries none of delta/done/error".into())
        }
    }
}

/// Boxed stream of normalized frames. Upstream adapters return this.
pub type FrameStream = futures::stream::BoxStream<'static, NormalizedFrame>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_work() {
        let d = NormalizedFrame::delta("hi");
        assert!(!d.is_terminal());
        assert_eq!(d.as_delta(), Some("hi"));

        assert!(NormalizedFrame::Done.is_terminal());
        assert!(NormalizedFrame::error("x").is_terminal());
        assert_eq!(NormalizedFrame::Done.as_delta(), None);
    }

    #[test]
    fn wire_shape_is_exact() {
        assert_eq!(NormalizedFrame::delta("a\"b").to_json(), r#"{"delta":"a\"b"}"#);
        assert_eq!(NormalizedFrame::Done.to_json(), r#"{"done":true}"#);
        assert_eq!(NormalizedFrame::error("boom").to_json(), r#"{"error":"boom"}"#);
    }

    #[test]
    fn decodes_wire_frames() {
        let f: NormalizedFrame = serde_json::from_str(r#"{"delta":""}"#).unwrap();
        assert_eq!(f, NormalizedFrame::delta(""));
        let f: NormalizedFrame = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert_eq!(f, NormalizedFrame::Done);
        let f: NormalizedFrame = serde_json::from_str(r#"{"error":"nope"}"#).unwrap();
        assert_eq!(f, NormalizedFrame::error("nope"));
    }

    #[test]
    fn rejects_empty_or_unknown_objects() {
        assert!(serde_json::from_str::<NormalizedFrame>("{}").is_err());
        assert!(serde_json::from_str::<NormalizedFrame>(r#"{"done":false}"#).is_err());
        assert!(serde_json::from_str::<NormalizedFrame>(r#"{"ping":1}"#).is_err());
    }
}
