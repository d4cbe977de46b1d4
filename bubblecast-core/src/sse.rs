//! Server-Sent-Events framing shared by both halves of the relay.
//!
//! [`EventDecoder`] turns an arbitrarily chunked byte stream into complete
//! `event:`/`data:` events. Events end at a blank line; anything after the
//! last blank line stays buffered until more bytes arrive, so splitting the
//! input at any byte offset yields the same events.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;

use crate::stream::NormalizedFrame;

const DEFAULT_EVENT: &str = "message";

/// One complete event: its name (default `message`) and concatenated data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: String,
    pub data: String,
}

/// Incremental, byte-oriented event framer.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        // CR only ever appears as part of CRLF line endings in these streams.
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut out = Vec::new();
        while let Some(idx) = find_blank_line(&self.buf) {
            let block: Vec<u8> = self.buf.drain(..idx + 2).collect();
            if let Some(ev) = parse_block(&block[..idx]) {
                out.push(ev);
            }
        }
        out
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<RawEvent> {
        let rest = std::mem::take(&mut self.buf);
        parse_block(&rest)
    }

    /// Bytes held back waiting for the rest of an event.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &[u8]) -> Option<RawEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event = DEFAULT_EVENT.to_string();
    let mut data = String::new();
    for line in text.split('\n') {
        if let Some(name) = line.strip_prefix("event:") {
            event = name.trim().to_string();
        } else if let Some(d) = line.strip_prefix("data:") {
            data.push_str(d.trim());
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(RawEvent { event, data })
}

/// Encode one normalized frame as an SSE `data:` block.
pub fn encode_frame(frame: &NormalizedFrame) -> String {
    format!("data: {}\n\n", frame.to_json())
}

/// Adapts a byte-chunk stream into a stream of [`RawEvent`]s.
pub struct EventReader<S> {
    inner: S,
    decoder: EventDecoder,
    ready: std::collections::VecDeque<RawEvent>,
    finished: bool,
}

impl<S> EventReader<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: EventDecoder::new(),
            ready: Default::default(),
            finished: false,
        }
    }
}

impl<S, E> Stream for EventReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<RawEvent, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(ev) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let events = self.decoder.push(&chunk);
                    self.ready.extend(events);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if let Some(ev) = self.decoder.finish() {
                        self.ready.push_back(ev);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
