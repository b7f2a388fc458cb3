//! Line filter for chat-completion event streams.
//!
//! The backend injects its own events (balance notices and the like) into
//! the stream it relays from workers. Public-dialect clients parse every
//! `data:` line as a completion chunk and fail on anything that lacks a
//! `choices` field, so those events are removed here.
//!
//! # Line Handling
//!
//! | Line | Action |
//! |------|--------|
//! | empty (event separator) | forward |
//! | `data: [DONE]` | forward |
//! | `data:` + JSON object with `choices` | forward |
//! | `data:` + JSON object without `choices` | drop |
//! | `data:` + anything else (invalid JSON, arrays) | forward |
//! | any other line | forward |
//!
//! Each forwarded line becomes its own body frame, so the server flushes
//! it without waiting for more backend output. Lines keep their order.

use bytes::{BufMut, Bytes, BytesMut};
use http_body::{Body, Frame};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{info, warn};

/// Longest line the filter buffers before giving up on the stream.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// Payload that terminates a public-dialect event stream.
pub const DONE_SENTINEL: &[u8] = b"[DONE]";

/// Field every legitimate completion chunk carries.
pub const REQUIRED_CHUNK_FIELD: &str = "choices";

const DATA_PREFIX: &[u8] = b"data:";

/// What a single line of the stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Empty line between events
    Separator,
    /// `data: [DONE]`
    Sentinel,
    /// JSON payload that is not a backend-internal event
    Chunk,
    /// JSON object without the required field
    BackendInternal,
    /// `data:` line whose payload is not JSON
    Unparseable,
    /// `event:`, `id:`, comments and anything else
    Other,
}

impl LineClass {
    pub fn is_forwarded(self) -> bool {
        self != LineClass::BackendInternal
    }
}

/// Payload of a `data:` line, without the prefix and one optional space.
fn data_payload(line: &[u8]) -> Option<&[u8]> {
    let rest = line.strip_prefix(DATA_PREFIX)?;
    Some(rest.strip_prefix(b" ").unwrap_or(rest))
}

/// Classify one line. `line` excludes its terminator.
pub fn classify_line(line: &[u8]) -> LineClass {
    if line.is_empty() {
        return LineClass::Separator;
    }
    let Some(payload) = data_payload(line) else {
        return LineClass::Other;
    };
    if payload == DONE_SENTINEL {
        return LineClass::Sentinel;
    }

    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) if !map.contains_key(REQUIRED_CHUNK_FIELD) => {
            LineClass::BackendInternal
        }
        Ok(_) => LineClass::Chunk,
        Err(_) => LineClass::Unparseable,
    }
}

/// A single line grew past [`MAX_LINE_BYTES`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("event stream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Terminal event sent to the client when the stream cannot continue.
pub fn overflow_event(err: &LineTooLong) -> Bytes {
    let payload = serde_json::json!({
        "error": {
            "message": err.to_string(),
            "type": "gateway_error",
            "code": "line_too_long",
        }
    });
    Bytes::from(format!("data: {}\n\n", payload))
}

/// Incremental line splitter and classifier.
///
/// Bytes are pushed as they arrive; complete lines come out in order, each
/// terminated by a single `\n`. A `\r` before the `\n` is removed.
#[derive(Debug, Default)]
pub struct EventFilter {
    pending: BytesMut,
    /// Prefix of `pending` already searched for a newline
    scanned: usize,
    forwarded: u64,
    dropped: u64,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines forwarded so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Backend-internal events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes held back waiting for a line terminator.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Feed a chunk; every line it completes is appended to `out`.
    ///
    /// # Errors
    ///
    /// Returns `LineTooLong` when a line, terminated or not, exceeds
    /// [`MAX_LINE_BYTES`]. Lines completed earlier in the same chunk are
    /// already in `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut VecDeque<Bytes>) -> Result<(), LineTooLong> {
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending[self.scanned..]
            .iter()
            .position(|&b| b == b'\n')
        {
            let end = self.scanned + pos;
            let line = self.pending.split_to(end + 1);
            self.scanned = 0;
            self.emit(line, out)?;
        }
        self.scanned = self.pending.len();

        // One byte of slack for a `\r` still waiting for its `\n`
        if self.pending.len() > MAX_LINE_BYTES + 1 {
            return Err(LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }
        Ok(())
    }

    /// Flush an unterminated final line at end of stream.
    pub fn finish(&mut self, out: &mut VecDeque<Bytes>) -> Result<(), LineTooLong> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut line = self.pending.split();
        self.scanned = 0;
        line.put_u8(b'\n');
        self.emit(line, out)
    }

    /// Classify a raw line ending in `\n` and queue it if it survives.
    fn emit(&mut self, mut line: BytesMut, out: &mut VecDeque<Bytes>) -> Result<(), LineTooLong> {
        let mut content_len = line.len() - 1;
        if content_len > 0 && line[content_len - 1] == b'\r' {
            content_len -= 1;
        }
        if content_len > MAX_LINE_BYTES {
            return Err(LineTooLong {
                limit: MAX_LINE_BYTES,
            });
        }

        let content = &line[..content_len];
        let class = classify_line(content);
        if !class.is_forwarded() {
            self.dropped += 1;
            info!(
                payload = %String::from_utf8_lossy(data_payload(content).unwrap_or(content)),
                "Filtered backend-internal stream event"
            );
            return Ok(());
        }

        if content_len + 1 != line.len() {
            line.truncate(content_len);
            line.put_u8(b'\n');
        }
        self.forwarded += 1;
        out.push_back(line.freeze());
        Ok(())
    }
}

/// Body adapter that runs an event stream through [`EventFilter`].
///
/// Inner body errors end the stream with that error; whatever was already
/// yielded stays with the client. A line overflow yields one terminal error
/// event and ends the stream cleanly.
pub struct FilteredBody<B> {
    inner: B,
    filter: EventFilter,
    ready: VecDeque<Bytes>,
    finished: bool,
}

impl<B> FilteredBody<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            filter: EventFilter::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    fn end(&mut self) {
        self.finished = true;
        info!(
            forwarded = self.filter.forwarded(),
            dropped = self.filter.dropped(),
            "Event stream finished"
        );
    }

    fn overflow(&mut self, err: LineTooLong) {
        warn!(
            limit = err.limit,
            buffered = self.filter.buffered(),
            "Event stream line too long, terminating stream"
        );
        self.ready.push_back(overflow_event(&err));
        self.end();
    }
}

impl<B> Body for FilteredBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        loop {
            if let Some(line) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(Frame::data(line))));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    // Trailers have no place in an event stream
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if let Err(err) = this.filter.push(&data, &mut this.ready) {
                        this.overflow(err);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    let err = e.into();
                    warn!(
                        error = %err,
                        forwarded = this.filter.forwarded(),
                        "Event stream interrupted"
                    );
                    this.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => match this.filter.finish(&mut this.ready) {
                    Ok(()) => this.end(),
                    Err(err) => this.overflow(err),
                },
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished && self.ready.is_empty()
    }
}
