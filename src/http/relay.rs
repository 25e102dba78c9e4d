//! Incremental SSE relay from an upstream response to the client.
//!
//! A spawned task owns the upstream body and pushes one frame per upstream
//! read into a bounded channel. The receiving half becomes the client
//! response body, so each frame is written as soon as it is sent. When the
//! client goes away the receiver is dropped, the next send fails and the task
//! stops reading upstream.

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::http::compression::{Encoding, StreamDecoder};
use crate::protocol::StreamTranslator;

const CHANNEL_CAPACITY: usize = 32;
const LOG_PREVIEW_CHARS: usize = 200;

type Frame = Result<Bytes, std::io::Error>;

/// How upstream bytes are turned into client frames.
#[derive(Debug, Clone)]
pub enum RelayMode {
    /// Forward bytes untouched.
    Verbatim,
    /// Decode, translate chat-completion chunks into native events.
    Translate { model: String },
}

/// Sending half of the relay. Every `send` is one body frame.
#[derive(Debug, Clone)]
pub struct RelaySink {
    tx: mpsc::Sender<Frame>,
}

impl RelaySink {
    /// `false` once the client has gone away.
    pub async fn send(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(Ok(bytes)).await.is_ok()
    }

    /// Abort the client response. The body ends with an error instead of a
    /// clean end-of-stream.
    pub async fn abort(&self, error: std::io::Error) {
        let _ = self.tx.send(Err(error)).await;
    }
}

/// Channel-backed response body and the sink that feeds it.
pub fn channel() -> (RelaySink, Body) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (RelaySink { tx }, Body::from_stream(ReceiverStream::new(rx)))
}

/// Start relaying `upstream` and return the client body.
pub fn relay(upstream: reqwest::Response, mode: RelayMode, request_id: String, backend: String) -> Body {
    let (sink, body) = channel();
    tokio::spawn(async move {
        let summary = match mode {
            RelayMode::Verbatim => relay_verbatim(upstream, &sink).await,
            RelayMode::Translate { model } => relay_translated(upstream, model, &sink).await,
        };
        tracing::debug!(
            request_id = %request_id,
            backend = %backend,
            bytes = summary.bytes,
            client_gone = summary.client_gone,
            upstream_error = summary.upstream_error,
            text_preview = %preview(&summary.text),
            "Stream relay finished"
        );
    });
    body
}

#[derive(Debug, Default)]
struct RelaySummary {
    bytes: usize,
    text: String,
    client_gone: bool,
    upstream_error: bool,
}

async fn relay_verbatim(upstream: reqwest::Response, sink: &RelaySink) -> RelaySummary {
    let mut summary = RelaySummary::default();
    let mut tap = TextTap::default();
    let mut stream = upstream.bytes_stream();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                summary.bytes += chunk.len();
                tap.feed(&chunk);
                if !sink.send(chunk).await {
                    summary.client_gone = true;
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Upstream stream failed mid-relay");
                summary.upstream_error = true;
                sink.abort(std::io::Error::other(e)).await;
                break;
            }
        }
    }

    summary.text = tap.text;
    summary
}

async fn relay_translated(upstream: reqwest::Response, model: String, sink: &RelaySink) -> RelaySummary {
    let mut summary = RelaySummary::default();
    if let Some(coding) = Encoding::unsupported(upstream.headers()) {
        tracing::warn!(content_encoding = %coding, "Upstream stream uses an encoding that cannot be translated");
        summary.upstream_error = true;
        let message = format!("cannot translate a {coding}-encoded stream");
        sink.abort(std::io::Error::new(std::io::ErrorKind::InvalidData, message)).await;
        return summary;
    }

    let mut decoder = StreamDecoder::for_headers(upstream.headers());
    let mut stream = upstream.bytes_stream();
    let mut translator = StreamTranslator::new(model);
    let mut lines = LineBuffer::default();
    let mut tap = TextTap::default();

    loop {
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Upstream stream failed mid-relay");
                summary.upstream_error = true;
                sink.abort(std::io::Error::other(e)).await;
                return summary;
            }
            None => break,
        };
        summary.bytes += chunk.len();

        let decoded = decoder.decode(chunk);

        let mut out = String::new();
        for line in lines.push(&decoded) {
            tap.feed_line(&line);
            translator.push_line(&line, &mut out);
        }
        if !sink.send(Bytes::from(out)).await {
            summary.client_gone = true;
            return summary;
        }
        if translator.is_finished() {
            break;
        }
        if decoder.is_failed() {
            summary.upstream_error = true;
            sink.abort(decode_failed()).await;
            return summary;
        }
    }

    // Clean end of stream: flush the decoder and close the native stream.
    let mut out = String::new();
    let tail = decoder.finish();
    for line in lines.push(&tail) {
        tap.feed_line(&line);
        translator.push_line(&line, &mut out);
    }
    if decoder.is_failed() && !translator.is_finished() {
        summary.upstream_error = true;
        if sink.send(Bytes::from(out)).await {
            sink.abort(decode_failed()).await;
        }
        return summary;
    }
    if let Some(line) = lines.take_rest() {
        tap.feed_line(&line);
        translator.push_line(&line, &mut out);
    }
    translator.finish(&mut out);
    if !sink.send(Bytes::from(out)).await {
        summary.client_gone = true;
    }

    summary.text = tap.text;
    summary
}

/// Splits decoded bytes into complete lines, keeping a partial tail.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Collects streamed text deltas for the end-of-stream log line.
#[derive(Debug, Default)]
struct TextTap {
    lines: LineBuffer,
    text: String,
}

impl TextTap {
    fn feed(&mut self, bytes: &[u8]) {
        for line in self.lines.push(bytes) {
            self.feed_line(&line);
        }
    }

    fn feed_line(&mut self, line: &str) {
        let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
            return;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data.trim()) else {
            return;
        };
        let text = value
            .pointer("/delta/text")
            .or_else(|| value.pointer("/choices/0/delta/content"))
            .and_then(|v| v.as_str());
        if let Some(text) = text {
            self.text.push_str(text);
        }
    }
}

fn decode_failed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "upstream stream failed to decode")
}

fn preview(text: &str) -> String {
    crate::http::error::snippet(text.as_bytes(), LOG_PREVIEW_CHARS)
}
