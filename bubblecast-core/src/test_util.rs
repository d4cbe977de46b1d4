//! Provider double for server and consumer tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::{CoreResult, RelayError};
use crate::http_client::RequestCtx;
use crate::model::{Completion, StreamRequest};
use crate::provider::ChatProvider;
use crate::stream::{FrameStream, NormalizedFrame};

/// Replays a fixed frame script. With `hang`, the stream stays open after the
/// script instead of ending.
#[derive(Default)]
pub struct ScriptedProvider {
    pub frames: Vec<NormalizedFrame>,
    pub hang: bool,
    pub calls: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicBool>,
    pub last_request: std::sync::Mutex<Option<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(frames: Vec<NormalizedFrame>) -> Self {
        Self {
            frames,
            ..Default::default()
        }
    }

    pub fn hanging(frames: Vec<NormalizedFrame>) -> Self {
        Self {
            frames,
            hang: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, req: &StreamRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(req.clone());
        }
    }
}

/// Flags the owning stream as dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: &StreamRequest, _ctx: &RequestCtx<'_>) -> CoreResult<Completion> {
        self.record(req);
        let mut text = String::new();
        for f in &self.frames {
            match f {
                NormalizedFrame::Delta { text: t } => text.push_str(t),
                NormalizedFrame::Done => break,
                NormalizedFrame::Error { message } => {
                    return Err(RelayError::ProviderError {
                        provider: "scripted".into(),
                        code: "500".into(),
                        message: message.clone(),
                    });
                }
            }
        }
        Ok(Completion {
            model: req.model.clone(),
            text,
            usage: None,
        })
    }

    async fn open_stream(&self, req: &StreamRequest, _ctx: &RequestCtx<'_>) -> FrameStream {
        self.record(req);
        let guard = DropFlag(self.dropped.clone());
        let script = stream::iter(self.frames.clone());
        let tail = if self.hang {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        stream::unfold((script.chain(tail), guard), |(mut frames, guard)| async move {
            frames.next().await.map(|f| (f, (frames, guard)))
        })
        .boxed()
    }
}
