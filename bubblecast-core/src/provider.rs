use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::CoreResult;
use crate::http_client::RequestCtx;
use crate::model::{Completion, StreamRequest};
use crate::stream::{FrameStream, NormalizedFrame};

/// A hosted language model reachable in buffered and streaming form.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One round trip; the full answer text.
    async fn complete(&self, req: &StreamRequest, ctx: &RequestCtx<'_>) -> CoreResult<Completion>;

    /// Incremental answer as normalized frames. Never fails: every failure
    /// becomes a single terminal `Error` frame.
    async fn open_stream(&self, req: &StreamRequest, ctx: &RequestCtx<'_>) -> FrameStream {
        // default: call complete once and wrap it
        let frames = match self.complete(req, ctx).await {
            Ok(c) => vec![NormalizedFrame::delta(c.text), NormalizedFrame::Done],
            Err(e) => vec![NormalizedFrame::error(e.to_string())],
        };
        stream::iter(frames).boxed()
    }
}
