//! Server-sent event plumbing shared by the streaming providers.

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crag_core::error::{CragError, Result};
use crag_core::types::StreamDelta;

/// One `event:`/`data:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder. Accepts raw bytes in arbitrary chunks,
/// including UTF-8 sequences and CRLF pairs split across chunk boundaries.
/// Invalid bytes decode to U+FFFD.
#[derive(Default)]
pub struct SseDecoder {
    text: String,
    partial_utf8: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every block completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.partial_utf8.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.partial_utf8) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.partial_utf8.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.partial_utf8[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.partial_utf8.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            self.partial_utf8.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        if self.text.contains('\r') {
            // Gemini and some proxies frame events with CRLF
            self.text = self.text.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.text.find("\n\n") {
            let block: String = self.text.drain(..end + 2).collect();
            events.extend(parse_block(&block));
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data = Vec::new();
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event_type,
        data: data.join("\n"),
    })
}

/// Decode a response body into events. A transport failure ends the
/// stream with an `LlmStream` error rather than a silent truncation.
pub fn sse_events<'a, S>(body: S) -> BoxStream<'a, Result<SseEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'a,
{
    let body = Box::pin(body);
    stream::unfold(
        (body, SseDecoder::new(), false),
        |(mut body, mut decoder, failed)| async move {
            if failed {
                return None;
            }
            loop {
                match body.next().await? {
                    Ok(bytes) => {
                        let events = decoder.push(&bytes);
                        if !events.is_empty() {
                            let batch: Vec<Result<SseEvent>> = events.into_iter().map(Ok).collect();
                            return Some((stream::iter(batch), (body, decoder, false)));
                        }
                    }
                    Err(e) => {
                        let err = CragError::LlmStream(format!("connection dropped: {}", e));
                        return Some((stream::iter(vec![Err(err)]), (body, decoder, true)));
                    }
                }
            }
        },
    )
    .flatten()
    .boxed()
}

/// Send a request and turn non-2xx replies into `LlmRequest` errors that
/// carry the status code, so the retry layer can classify them.
pub(crate) async fn send_checked(request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| CragError::LlmRequest(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(CragError::LlmRequest(format!("HTTP {}: {}", status, body)))
}

/// Map each event of a streaming response through a provider's parser.
pub(crate) fn delta_stream<'a, F, I>(response: reqwest::Response, parse: F) -> BoxStream<'a, Result<StreamDelta>>
where
    F: Fn(SseEvent) -> I + Send + 'a,
    I: IntoIterator<Item = Result<StreamDelta>>,
{
    sse_events(response.bytes_stream())
        .flat_map(move |event| {
            let deltas: Vec<Result<StreamDelta>> = match event {
                Ok(event) => parse(event).into_iter().collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(deltas)
        })
        .boxed()
}
