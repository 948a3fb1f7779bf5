//! Body decoders for the two streaming transports.
//!
//! Network chunks do not line up with records. The chunked decoder keeps the
//! undecoded tail of each chunk as raw bytes and only splits on `\n`, so a
//! record (or a multi-byte character) cut in half by the network is decoded
//! once the rest arrives. SSE framing is delegated to `eventsource-stream`.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::{ChatError, CoreResult};
use crate::stream::{ByteStream, RecordStream, StreamRecord, StreamTransport};

/// Prefix carried by every record of the chunked transport.
pub const DATA_PREFIX: &str = "data:";

/// Decode a response body with the given framing.
pub fn decode(transport: StreamTransport, body: ByteStream) -> RecordStream {
    match transport {
        StreamTransport::EventStream => decode_event_stream(body),
        StreamTransport::Chunked => decode_chunked(body),
    }
}

/// SSE: one record per event; empty payloads and undecodable JSON are dropped.
pub fn decode_event_stream(body: ByteStream) -> RecordStream {
    body.eventsource()
        .filter_map(|item| async move {
            match item {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        return None;
                    }
                    parse_payload(data).map(Ok)
                }
                Err(EventStreamError::Transport(e)) => Some(Err(e)),
                Err(e) => Some(Err(ChatError::Protocol(format!("event stream: {e}")))),
            }
        })
        .boxed()
}

/// Newline-delimited `data:` records over a plain body.
pub fn decode_chunked(body: ByteStream) -> RecordStream {
    Box::pin(ChunkedRecords::new(body))
}

fn parse_payload(payload: &str) -> Option<StreamRecord> {
    match StreamRecord::parse(payload) {
        Ok(record) => {
            debug!(?record, "decoded record");
            Some(record)
        }
        Err(e) => {
            warn!(error = %e, payload = %truncate(payload, 120), "skipping malformed record");
            None
        }
    }
}

/// Decode one complete line of the chunked transport.
fn decode_line(line: &[u8]) -> Option<StreamRecord> {
    let line = match std::str::from_utf8(line) {
        Ok(s) => s.trim(),
        Err(e) => {
            warn!(error = %e, "skipping record with invalid utf-8");
            return None;
        }
    };
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        return None;
    }
    parse_payload(payload)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Record splitter over a bytes stream; carries the partial tail between chunks.
struct ChunkedRecords<S> {
    inner: S,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no `\n`.
    scanned: usize,
    finished: bool,
}

impl<S> ChunkedRecords<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            scanned: 0,
            finished: false,
        }
    }

    /// Take the next complete line off the buffer, newline included.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        match self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let end = self.scanned + pos;
                self.scanned = 0;
                Some(self.buf.drain(..=end).collect())
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

impl<S> Stream for ChunkedRecords<S>
where
    S: Stream<Item = CoreResult<Bytes>> + Unpin,
{
    type Item = CoreResult<StreamRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // Complete lines already buffered are drained before polling for more bytes.
            if let Some(line) = self.next_line() {
                match decode_line(&line) {
                    Some(record) => return Poll::Ready(Some(Ok(record))),
                    None => continue,
                }
            }

            if self.finished {
                if self.buf.is_empty() {
                    return Poll::Ready(None);
                }
                // Final record without a trailing newline.
                let tail = std::mem::take(&mut self.buf);
                self.scanned = 0;
                match decode_line(&tail) {
                    Some(record) => return Poll::Ready(Some(Ok(record))),
                    None => return Poll::Ready(None),
                }
            }

            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.buf.clear();
                    self.scanned = 0;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
