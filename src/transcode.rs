//! Bedrock event-stream to Anthropic Server-Sent Events.
//!
//! [`SseTranscoder`] wraps the upstream body and is itself the response body:
//! a frame is decoded only when hyper asks for the next chunk, and each
//! recognized frame becomes exactly one SSE record.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hyper::body::{Body, Bytes, Frame as BodyFrame, SizeHint};
use serde_json::{Value, json};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::{debug, warn};

use crate::error::Error;
use crate::eventstream::{Frame, FrameDecoder};

/// What a single upstream frame turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// One SSE record for the client.
    Record(Bytes),
    /// Nothing to send.
    Skip,
    /// A final error record; the stream ends after it.
    Terminal(Bytes),
}

/// Classify one decoded frame.
pub fn transcode_frame(frame: &Frame) -> Outcome {
    match frame.message_type() {
        Some("event") => {
            let is_json = frame.content_type().is_some_and(|ct| ct.contains("json"));
            if !is_json {
                debug!(
                    event_type = ?frame.event_type(),
                    content_type = ?frame.content_type(),
                    "Dropping non-JSON event frame"
                );
                return Outcome::Skip;
            }
            match chunk_record(&frame.payload) {
                Ok(record) => Outcome::Record(record),
                Err(reason) => {
                    warn!(reason = %reason, "Skipping malformed stream frame");
                    Outcome::Skip
                }
            }
        }
        Some("exception") => {
            let kind = frame.exception_type().unwrap_or("internalServerException");
            Outcome::Terminal(error_record(kind, &exception_message(&frame.payload)))
        }
        Some("error") => {
            let kind = frame.header(":error-code").unwrap_or("internalServerException");
            let message = frame
                .header(":error-message")
                .map(str::to_string)
                .unwrap_or_else(|| exception_message(&frame.payload));
            Outcome::Terminal(error_record(kind, &message))
        }
        other => {
            debug!(message_type = ?other, "Dropping frame with unknown message type");
            Outcome::Skip
        }
    }
}

/// Unwrap a `{"bytes": "<base64>"}` envelope into an SSE record.
fn chunk_record(payload: &[u8]) -> Result<Bytes, String> {
    let envelope: Value =
        serde_json::from_slice(payload).map_err(|e| format!("envelope is not JSON: {}", e))?;
    let encoded = envelope
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or("envelope has no bytes field")?;
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| format!("invalid base64: {}", e))?;
    let text = String::from_utf8(decoded).map_err(|e| format!("chunk is not UTF-8: {}", e))?;
    let inner: Value =
        serde_json::from_str(&text).map_err(|e| format!("chunk is not JSON: {}", e))?;
    let event_type = inner
        .get("type")
        .and_then(Value::as_str)
        .ok_or("chunk has no type field")?;
    if event_type.is_empty() || event_type.chars().any(char::is_control) {
        return Err(format!("chunk type {:?} is not a valid event name", event_type));
    }

    // A data line cannot span lines, so chunks with raw line breaks are compacted.
    let data = if text.contains(['\n', '\r']) {
        inner.to_string()
    } else {
        text
    };
    Ok(sse_record(event_type, &data))
}

fn sse_record(event_type: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event_type, data))
}

fn exception_message(payload: &[u8]) -> String {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned())
}

/// Anthropic error type for a Bedrock exception name.
pub fn anthropic_error_type(exception: &str) -> &'static str {
    let lower = exception.to_ascii_lowercase();
    if lower.contains("throttling") {
        "rate_limit_error"
    } else if lower.contains("validation") {
        "invalid_request_error"
    } else if lower.contains("serviceunavailable") {
        "overloaded_error"
    } else {
        "api_error"
    }
}

fn error_record(exception: &str, message: &str) -> Bytes {
    warn!(exception = %exception, message = %message, "Bedrock stream reported an error");
    let body = json!({
        "type": "error",
        "error": {
            "type": anthropic_error_type(exception),
            "message": message,
        }
    });
    sse_record("error", &body.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Done,
}

/// Response body that transcodes an upstream event stream on demand.
pub struct SseTranscoder<B> {
    upstream: B,
    decoder: FrameDecoder,
    state: State,
    records: u64,
}

impl<B> SseTranscoder<B> {
    pub fn new(upstream: B) -> Self {
        Self {
            upstream,
            decoder: FrameDecoder::new(),
            state: State::Streaming,
            records: 0,
        }
    }

    fn finish(&mut self) {
        self.state = State::Done;
        debug!(records = self.records, "Event stream finished");
    }
}

impl<B> Body for SseTranscoder<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<BodyFrame<Bytes>, Error>>> {
        let this = self.get_mut();

        loop {
            if this.state == State::Done {
                return Poll::Ready(None);
            }

            match this.decoder.next_frame() {
                Some(Ok(frame)) => match transcode_frame(&frame) {
                    Outcome::Record(record) => {
                        this.records += 1;
                        return Poll::Ready(Some(Ok(BodyFrame::data(record))));
                    }
                    Outcome::Skip => continue,
                    Outcome::Terminal(record) => {
                        this.finish();
                        return Poll::Ready(Some(Ok(BodyFrame::data(record))));
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, records = this.records, "Aborting event stream");
                    this.finish();
                    return Poll::Ready(Some(Err(Error::StreamDecode(e))));
                }
                None => {}
            }

            match ready!(Pin::new(&mut this.upstream).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        this.decoder.push(data);
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, records = this.records, "Upstream body failed mid-stream");
                    this.finish();
                    return Poll::Ready(Some(Err(Error::Upstream(e.to_string()))));
                }
                None => {
                    let leftover = this.decoder.finish();
                    this.finish();
                    return Poll::Ready(leftover.err().map(|e| Err(Error::StreamDecode(e))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state == State::Done
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
