//! Client side of the relay: ask a question, receive the answer as frames.
//!
//! [`StreamConsumer::ask`] first tries the `/chat-sse` stream. If that
//! connection cannot be established it falls back to `POST /api/claude` and
//! replays the buffered answer as small deltas, so callers see the same frame
//! sequence either way. The returned [`AnswerStream`] can be cancelled at any
//! time; cancelling aborts the background request.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::{
    error::{CoreResult, RelayError},
    http_client::{ByteStream, HttpClient, RequestCtx},
    model::{ClaudeBody, ClaudeReply},
    sse::EventReader,
    stream::NormalizedFrame,
};

pub const DEFAULT_FRAGMENT_CHARS: usize = 80;
pub const DEFAULT_FRAGMENT_DELAY: Duration = Duration::from_millis(8);

const ANSWER_BUFFER: usize = 64;

/// One question for the relay. Unset fields use the server's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AskRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl AskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut q = vec![("message", self.prompt.clone())];
        if let Some(s) = &self.system {
            q.push(("systemPrompt", s.clone()));
        }
        if let Some(m) = &self.model {
            q.push(("model", m.clone()));
        }
        if let Some(n) = self.max_tokens {
            q.push(("maxTokens", n.to_string()));
        }
        if let Some(t) = self.temperature {
            q.push(("temperature", t.to_string()));
        }
        q
    }

    fn buffered_body(&self) -> ClaudeBody {
        ClaudeBody {
            prompt: Some(self.prompt.clone()),
            system: self.system.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens.map(Value::from),
            temperature: self.temperature.map(|t| Value::from(f64::from(t))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConsumer {
    base: String,
    /// Origin serving `/chat-sse`, when it differs from `base`.
    stream_base: Option<String>,
    http: HttpClient,
    fragment_chars: usize,
    fragment_delay: Duration,
}

impl StreamConsumer {
    pub fn new(base: impl Into<String>, http: HttpClient) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
            stream_base: None,
            http,
            fragment_chars: DEFAULT_FRAGMENT_CHARS,
            fragment_delay: DEFAULT_FRAGMENT_DELAY,
        }
    }

    /// Fragment size and pacing used when replaying a buffered answer.
    pub fn with_fragments(mut self, chars: usize, delay: Duration) -> Self {
        self.fragment_chars = chars.max(1);
        self.fragment_delay = delay;
        self
    }

    pub fn with_stream_base(mut self, base: impl Into<String>) -> Self {
        let base: String = base.into();
        self.stream_base = Some(base.trim_end_matches('/').to_string());
        self
    }

    /// Start asking. Never blocks; all I/O happens on a spawned task.
    pub fn ask(&self, req: AskRequest) -> AnswerStream {
        let (tx, rx) = mpsc::channel(ANSWER_BUFFER);
        let this = self.clone();
        let task = tokio::spawn(async move { this.run(req, tx).await });
        AnswerStream {
            rx,
            task: task.abort_handle(),
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: false,
            recorder: None,
        }
    }

    async fn run(&self, req: AskRequest, tx: mpsc::Sender<NormalizedFrame>) {
        let rid = uuid::Uuid::new_v4().to_string();
        let ctx = RequestCtx::provider("relay").with_request_id(Some(&rid));
        match self.open_sse(&req, &ctx).await {
            Ok(body) => forward_sse(body, &tx).await,
            Err(e) => {
                tracing::info!(error = %e, request_id = %rid, "event stream unavailable, using buffered answer");
                self.replay_buffered(&req, &ctx, &tx).await;
            }
        }
    }

    async fn open_sse(&self, req: &AskRequest, ctx: &RequestCtx<'_>) -> CoreResult<ByteStream> {
        let base = self.stream_base.as_deref().unwrap_or(&self.base);
        let mut url = reqwest::Url::parse(&format!("{base}/chat-sse"))
            .map_err(|e| RelayError::Validation(format!("bad relay base url: {e}")))?;
        url.query_pairs_mut().extend_pairs(req.query_pairs());
        self.http.get_event_stream(url.as_str(), ctx).await
    }

    async fn replay_buffered(&self, req: &AskRequest, ctx: &RequestCtx<'_>, tx: &mpsc::Sender<NormalizedFrame>) {
        let url = format!("{}/api/claude", self.base);
        let reply = self
            .http
            .post_json::<_, ClaudeReply>(&url, &req.buffered_body(), &[], ctx)
            .await;
        let text = match reply {
            Ok((reply, _, _)) => reply.text,
            Err(e) => {
                let _ = tx.send(NormalizedFrame::error(e.to_string())).await;
                return;
            }
        };
        for piece in fragments(&text, self.fragment_chars) {
            if tx.send(NormalizedFrame::delta(piece)).await.is_err() {
                return;
            }
            tokio::time::sleep(self.fragment_delay).await;
        }
        let _ = tx.send(NormalizedFrame::Done).await;
    }
}

/// Decode relay frames until the first terminal one.
async fn forward_sse(body: ByteStream, tx: &mpsc::Sender<NormalizedFrame>) {
    let mut events = EventReader::new(body);
    while let Some(ev) = events.next().await {
        let frame = match ev {
            Ok(ev) => match serde_json::from_str::<NormalizedFrame>(&ev.data) {
                Ok(f) => f,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable frame");
                    continue;
                }
            },
            Err(e) => NormalizedFrame::error(format!("answer stream interrupted: {e}")),
        };
        let terminal = frame.is_terminal();
        if tx.send(frame).await.is_err() || terminal {
            return;
        }
    }
    let _ = tx
        .send(NormalizedFrame::error("answer stream closed before completion"))
        .await;
}

/// Split `text` into pieces of at most `max` characters, never inside a
/// code point. Concatenating the pieces gives back `text`.
pub fn fragments(text: &str, max: usize) -> Vec<&str> {
    let max = max.max(1);
    let mut out = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == max {
            out.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Cancels an [`AnswerStream`] from anywhere. Idempotent.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    task: AbortHandle,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.task.abort();
            tracing::debug!("answer cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How an answer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Error(String),
    Cancelled,
}

/// Callback view of an answer. At most one of `on_done`/`on_error` is called,
/// and nothing is called after it.
pub trait AnswerHandler {
    fn on_delta(&mut self, text: &str);
    fn on_done(&mut self);
    fn on_error(&mut self, message: &str);
}

/// Frames of one answer, ending after the first terminal frame.
pub struct AnswerStream {
    rx: mpsc::Receiver<NormalizedFrame>,
    task: AbortHandle,
    cancelled: Arc<AtomicBool>,
    finished: bool,
    recorder: Option<Recorder>,
}

impl AnswerStream {
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: self.cancelled.clone(),
            task: self.task.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Feed every frame to `handler` and report how the answer ended.
    pub async fn drive<H: AnswerHandler + ?Sized>(mut self, handler: &mut H) -> Outcome {
        while let Some(frame) = self.next().await {
            match frame {
                NormalizedFrame::Delta { text } => handler.on_delta(&text),
                NormalizedFrame::Done => {
                    handler.on_done();
                    return Outcome::Done;
                }
                NormalizedFrame::Error { message } => {
                    handler.on_error(&message);
                    return Outcome::Error(message);
                }
            }
        }
        if self.is_cancelled() {
            return Outcome::Cancelled;
        }
        // the producer died without a terminal frame
        let message = "answer stream ended unexpectedly".to_string();
        handler.on_error(&message);
        Outcome::Error(message)
    }

    fn record_into(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

impl Stream for AnswerStream {
    type Item = NormalizedFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished || self.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if frame.is_terminal() {
                    self.finished = true;
                }
                if let (Some(rec), Some(text)) = (&self.recorder, frame.as_delta()) {
                    rec.append(text);
                }
                Poll::Ready(Some(frame))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Default)]
struct Transcript {
    generation: u64,
    text: String,
}

#[derive(Debug, Clone)]
struct Recorder {
    transcript: Arc<Mutex<Transcript>>,
    generation: u64,
}

impl Recorder {
    fn append(&self, text: &str) {
        if let Ok(mut t) = self.transcript.lock()
            && t.generation == self.generation
        {
            t.text.push_str(text);
        }
    }
}

/// One popup's conversation: at most one answer in flight. Asking again
/// cancels the previous answer and clears the accumulated text.
pub struct AnswerSession {
    consumer: StreamConsumer,
    transcript: Arc<Mutex<Transcript>>,
    current: Option<CancelHandle>,
}

impl AnswerSession {
    pub fn new(consumer: StreamConsumer) -> Self {
        Self {
            consumer,
            transcript: Arc::default(),
            current: None,
        }
    }

    pub fn ask(&mut self, req: AskRequest) -> AnswerStream {
        self.cancel();
        let generation = match self.transcript.lock() {
            Ok(mut t) => {
                t.generation += 1;
                t.text.clear();
                t.generation
            }
            Err(_) => 0,
        };
        let stream = self.consumer.ask(req).record_into(Recorder {
            transcript: self.transcript.clone(),
            generation,
        });
        self.current = Some(stream.cancel_handle());
        stream
    }

    pub fn cancel(&mut self) {
        if let Some(prev) = self.current.take() {
            prev.cancel();
        }
    }

    /// Text received so far for the current answer.
    pub fn answer(&self) -> String {
        self.transcript
            .lock()
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }
}
