//! Messages API event stream → normalized frames.
//!
//! The provider frames its stream as `event: <name>` + `data: <json>` blocks.
//! Only two kinds matter here: `content_block_delta` carrying a `text_delta`
//! becomes `Delta`, and `message_stop` becomes `Done`. A provider-side `error`
//! event becomes `Error`. Everything else (`message_start`, `ping`, ...) is
//! skipped. An interior frame whose JSON does not parse is dropped and
//! counted; it never aborts the stream.

use std::fmt::Display;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::error::RelayError;
use crate::sse::{EventReader, RawEvent};
use crate::stream::{FrameStream, NormalizedFrame};
use crate::telemetry::{StreamLog, Terminal, emit_stream};

#[derive(Deserialize)]
struct ADeltaEvent {
    delta: ADelta,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ADelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AErrorEvent {
    #[serde(default)]
    error: Option<AErrorBody>,
}

#[derive(Deserialize)]
struct AErrorBody {
    #[serde(default)]
    message: Option<String>,
}

enum Mapped {
    Frame(NormalizedFrame),
    Skip,
    Malformed(serde_json::Error),
}

fn map_event(ev: &RawEvent) -> Mapped {
    match ev.event.as_str() {
        "content_block_delta" => match serde_json::from_str::<ADeltaEvent>(&ev.data) {
            Ok(ADeltaEvent {
                delta: ADelta::TextDelta { text },
            }) => Mapped::Frame(NormalizedFrame::Delta { text }),
            Ok(_) => Mapped::Skip,
            Err(e) => Mapped::Malformed(e),
        },
        "message_stop" => match serde_json::from_str::<serde_json::Value>(&ev.data) {
            Ok(_) => Mapped::Frame(NormalizedFrame::Done),
            Err(e) => Mapped::Malformed(e),
        },
        "error" => match serde_json::from_str::<AErrorEvent>(&ev.data) {
            Ok(body) => Mapped::Frame(NormalizedFrame::error(
                body.error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "upstream reported an error".into()),
            )),
            Err(e) => Mapped::Malformed(e),
        },
        _ => Mapped::Skip,
    }
}

/// Identity of one upstream stream, for logs and the stream summary.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub provider: String,
    pub model: String,
    pub request_id: Option<String>,
    pub idle_timeout: Duration,
}

struct AdapterState<S> {
    events: EventReader<S>,
    meta: StreamMeta,
    started: Instant,
    deltas: u32,
    dropped: u32,
    finished: bool,
}

impl<S> AdapterState<S> {
    fn finish(&mut self, frame: &NormalizedFrame) {
        self.finished = true;
        let latency = self.started.elapsed().as_millis() as u64;
        let (terminal, message) = match frame {
            NormalizedFrame::Error { message } => (Terminal::Error, Some(message.as_str())),
            _ => (Terminal::Done, None),
        };
        match terminal {
            Terminal::Done => tracing::info!(
                provider = %self.meta.provider,
                model = %self.meta.model,
                deltas = self.deltas,
                dropped = self.dropped,
                latency_ms = latency,
                "upstream stream completed"
            ),
            Terminal::Error => tracing::warn!(
                provider = %self.meta.provider,
                model = %self.meta.model,
                deltas = self.deltas,
                dropped = self.dropped,
                latency_ms = latency,
                error = message.unwrap_or_default(),
                "upstream stream failed"
            ),
        }
        emit_stream(
            StreamLog::new()
                .provider(&self.meta.provider)
                .model(&self.meta.model)
                .request_id_opt(self.meta.request_id.as_deref())
                .latency_ms(latency)
                .counts(self.deltas, self.dropped)
                .terminal(terminal)
                .error_message_opt(message),
        );
    }
}

/// Normalize a raw provider byte stream.
///
/// The returned sequence always ends in exactly one terminal frame: the
/// provider's own `Done`/`Error`, or a synthesized `Error` when the body
/// fails, ends early, or stays silent for longer than the idle timeout.
/// Dropping the returned stream drops (and so closes) the byte source.
pub fn normalize_events<S, E>(bytes: S, meta: StreamMeta) -> FrameStream
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let state = AdapterState {
        events: EventReader::new(bytes),
        meta,
        started: Instant::now(),
        deltas: 0,
        dropped: 0,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            let frame = match tokio::time::timeout(st.meta.idle_timeout, st.events.next()).await {
                Err(_) => NormalizedFrame::error(
                    RelayError::IdleTimeout {
                        provider: st.meta.provider.clone(),
                        secs: st.meta.idle_timeout.as_secs(),
                    }
                    .to_string(),
                ),
                Ok(None) => NormalizedFrame::error(format!(
                    "{} stream closed before completion",
                    st.meta.provider
                )),
                Ok(Some(Err(e))) => {
                    NormalizedFrame::error(format!("{} stream read failed: {e}", st.meta.provider))
                }
                Ok(Some(Ok(ev))) => match map_event(&ev) {
                    Mapped::Frame(f) => f,
                    Mapped::Skip => continue,
                    Mapped::Malformed(e) => {
                        st.dropped += 1;
                        tracing::debug!(
                            provider = %st.meta.provider,
                            event = %ev.event,
                            error = %e,
                            "dropping malformed upstream frame"
                        );
                        continue;
                    }
                },
            };
            if frame.is_terminal() {
                st.finish(&frame);
            } else {
                st.deltas += 1;
            }
            return Some((frame, st));
        }
    })
    .boxed()
}

/// A stream that fails before any byte was read: one `Error` frame.
pub fn failed(meta: &StreamMeta, err: &RelayError) -> FrameStream {
    tracing::warn!(
        provider = %meta.provider,
        model = %meta.model,
        error = %err,
        "upstream stream could not be opened"
    );
    emit_stream(
        StreamLog::new()
            .provider(&meta.provider)
            .model(&meta.model)
            .request_id_opt(meta.request_id.as_deref())
            .terminal(Terminal::Error)
            .error_message_opt(Some(&err.to_string())),
    );
    stream::iter([NormalizedFrame::error(err.to_string())]).boxed()
}
