//! Response body decoding for gzip and zstd.
//!
//! Upstreams answer with whatever `Accept-Encoding` the client sent, and some
//! of them compress without saying so. Bodies the proxy has to read (error
//! bodies for logs, responses it converts) go through here first.
//!
//! # Rules
//! - Declared `gzip`/`zstd` is decoded.
//! - No declared encoding: gzip magic `1f 8b` or zstd magic `28 b5 2f fd`
//!   triggers a decode attempt.
//! - A failed decode yields the raw bytes. A failed read yields the bytes
//!   read so far.

use std::io::{Read, Write};

use axum::http::{header::CONTENT_ENCODING, HeaderMap};
use bytes::Bytes;
use futures_util::StreamExt;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Zstd,
}

impl Encoding {
    /// Encoding named by `Content-Encoding`, or `None` when the header is
    /// absent or empty. Unsupported codings map to `Identity`.
    pub fn declared(headers: &HeaderMap) -> Option<Encoding> {
        let value = headers.get(CONTENT_ENCODING)?.to_str().ok()?.trim();
        if value.is_empty() {
            return None;
        }
        let encoding = match value.to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Encoding::Gzip,
            "zstd" => Encoding::Zstd,
            _ => Encoding::Identity,
        };
        Some(encoding)
    }

    pub fn sniff(bytes: &[u8]) -> Encoding {
        if bytes.starts_with(&GZIP_MAGIC) {
            Encoding::Gzip
        } else if bytes.starts_with(&ZSTD_MAGIC) {
            Encoding::Zstd
        } else {
            Encoding::Identity
        }
    }

    /// Declared coding the codec cannot decode (`br`, `deflate`, ...).
    pub fn unsupported(headers: &HeaderMap) -> Option<String> {
        let value = headers.get(CONTENT_ENCODING)?.to_str().ok()?.trim().to_ascii_lowercase();
        match value.as_str() {
            "" | "identity" | "gzip" | "x-gzip" | "zstd" => None,
            _ => Some(value),
        }
    }

    /// Declared encoding, falling back to sniffing the first bytes.
    pub fn resolve(headers: &HeaderMap, first_bytes: &[u8]) -> Encoding {
        Encoding::declared(headers).unwrap_or_else(|| Encoding::sniff(first_bytes))
    }
}

/// A decoded body and whether any decoding was applied.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub bytes: Bytes,
    pub was_encoded: bool,
}

pub fn decode_body(headers: &HeaderMap, raw: Bytes) -> Decoded {
    let encoding = Encoding::resolve(headers, &raw);
    let result = match encoding {
        Encoding::Identity => {
            return Decoded {
                bytes: raw,
                was_encoded: false,
            }
        }
        Encoding::Gzip => gunzip(&raw),
        Encoding::Zstd => zstd::stream::decode_all(raw.as_ref()),
    };

    match result {
        Ok(decoded) => Decoded {
            bytes: Bytes::from(decoded),
            was_encoded: true,
        },
        Err(e) => {
            tracing::debug!(encoding = ?encoding, error = %e, "Body decode failed, using raw bytes");
            Decoded {
                bytes: raw,
                was_encoded: false,
            }
        }
    }
}

fn gunzip(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::MultiGzDecoder::new(raw).read_to_end(&mut out)?;
    Ok(out)
}

/// Read a whole upstream body, keeping what arrived before any read error.
pub async fn read_raw(response: reqwest::Response) -> Bytes {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(e) => {
                tracing::debug!(error = %e, read = buf.len(), "Upstream body read interrupted");
                break;
            }
        }
    }
    Bytes::from(buf)
}

/// Read and decode a whole upstream body.
pub async fn read_body(response: reqwest::Response) -> Decoded {
    let headers = response.headers().clone();
    let raw = read_raw(response).await;
    decode_body(&headers, raw)
}

/// Incremental decoder for streamed bodies.
///
/// Decoded output is drained after every chunk so translated events reach the
/// client as soon as their bytes arrive. A decode error ends the output; what
/// was decoded before it is still returned. Without a declared encoding the
/// first bytes are held back until there are enough to sniff the magic.
pub struct StreamDecoder {
    inner: Inner,
}

enum Inner {
    Identity,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
    Sniffing(Vec<u8>),
    Failed,
}

impl StreamDecoder {
    pub fn new(encoding: Encoding) -> Self {
        let inner = match encoding {
            Encoding::Identity => Inner::Identity,
            Encoding::Gzip => Inner::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            Encoding::Zstd => match zstd::stream::write::Decoder::new(Vec::new()) {
                Ok(decoder) => Inner::Zstd(decoder),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create zstd stream decoder");
                    Inner::Failed
                }
            },
        };
        Self { inner }
    }

    /// Decoder for a response with `headers`.
    pub fn for_headers(headers: &HeaderMap) -> Self {
        match Encoding::declared(headers) {
            Some(encoding) => Self::new(encoding),
            None => Self {
                inner: Inner::Sniffing(Vec::new()),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.inner, Inner::Failed)
    }

    pub fn decode(&mut self, chunk: Bytes) -> Bytes {
        if let Inner::Sniffing(pending) = &mut self.inner {
            pending.extend_from_slice(&chunk);
            if pending.len() < ZSTD_MAGIC.len() {
                return Bytes::new();
            }
            return self.resolve_pending();
        }

        let result = match &mut self.inner {
            Inner::Identity => return chunk,
            Inner::Failed | Inner::Sniffing(_) => return Bytes::new(),
            Inner::Gzip(decoder) => write_and_drain(decoder, &chunk, |d| d.get_mut()),
            Inner::Zstd(decoder) => write_and_drain(decoder, &chunk, |d| d.get_mut()),
        };
        self.settle(result)
    }

    /// Flush whatever the decoder still holds at end of stream.
    pub fn finish(&mut self) -> Bytes {
        if matches!(self.inner, Inner::Sniffing(_)) {
            let mut out = self.resolve_pending().to_vec();
            out.extend_from_slice(&self.finish());
            return Bytes::from(out);
        }

        let result = match &mut self.inner {
            Inner::Identity | Inner::Failed | Inner::Sniffing(_) => return Bytes::new(),
            Inner::Gzip(decoder) => match decoder.try_finish() {
                Ok(()) => Ok(std::mem::take(decoder.get_mut())),
                Err(e) => Err((e, std::mem::take(decoder.get_mut()))),
            },
            Inner::Zstd(decoder) => match decoder.flush() {
                Ok(()) => Ok(std::mem::take(decoder.get_mut())),
                Err(e) => Err((e, std::mem::take(decoder.get_mut()))),
            },
        };
        self.settle(result)
    }

    /// Pick the encoding from the held-back bytes and decode them.
    fn resolve_pending(&mut self) -> Bytes {
        let Inner::Sniffing(pending) = &mut self.inner else {
            return Bytes::new();
        };
        let buffered = std::mem::take(pending);
        *self = Self::new(Encoding::sniff(&buffered));
        self.decode(Bytes::from(buffered))
    }

    fn settle(&mut self, result: Result<Vec<u8>, (std::io::Error, Vec<u8>)>) -> Bytes {
        match result {
            Ok(out) => Bytes::from(out),
            Err((e, partial)) => {
                tracing::warn!(error = %e, "Stream decode failed, dropping the rest of the body");
                self.inner = Inner::Failed;
                Bytes::from(partial)
            }
        }
    }
}

fn write_and_drain<W, F>(
    decoder: &mut W,
    chunk: &[u8],
    out: F,
) -> Result<Vec<u8>, (std::io::Error, Vec<u8>)>
where
    W: Write,
    F: Fn(&mut W) -> &mut Vec<u8>,
{
    let written = decoder.write_all(chunk).and_then(|()| decoder.flush());
    let drained = std::mem::take(out(decoder));
    match written {
        Ok(()) => Ok(drained),
        Err(e) => Err((e, drained)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use flate2::{write::GzEncoder, Compression};

    fn gzip(input: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(input).unwrap();
        encoder.finish().unwrap()
    }

    fn zstd_bytes(input: &[u8]) -> Vec<u8> {
        zstd::stream::encode_all(input, 3).unwrap()
    }

    fn headers_with(encoding: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        headers
    }

    #[test]
    fn decodes_declared_gzip() {
        let body = gzip(br#"{"error":"overloaded"}"#);
        let decoded = decode_body(&headers_with("gzip"), Bytes::from(body));
        assert!(decoded.was_encoded);
        assert_eq!(decoded.bytes.as_ref(), br#"{"error":"overloaded"}"#);
    }

    #[test]
    fn sniffs_undeclared_gzip_and_zstd() {
        let gz = decode_body(&HeaderMap::new(), Bytes::from(gzip(b"hello gzip")));
        assert_eq!(gz.bytes.as_ref(), b"hello gzip");

        let zs = decode_body(&HeaderMap::new(), Bytes::from(zstd_bytes(b"hello zstd")));
        assert_eq!(zs.bytes.as_ref(), b"hello zstd");
        assert!(zs.was_encoded);
    }

    #[test]
    fn corrupted_gzip_returns_raw_bytes() {
        let mut body = gzip(b"some payload that will be damaged");
        let len = body.len();
        body.truncate(len / 2);
        body.extend_from_slice(b"garbage");

        let raw = Bytes::from(body);
        let decoded = decode_body(&headers_with("gzip"), raw.clone());
        assert!(!decoded.was_encoded);
        assert_eq!(decoded.bytes, raw);
    }

    #[test]
    fn plain_and_unsupported_bodies_pass_through() {
        let raw = Bytes::from_static(b"plain text");
        assert_eq!(decode_body(&HeaderMap::new(), raw.clone()).bytes, raw);
        assert_eq!(decode_body(&headers_with("br"), raw.clone()).bytes, raw);
        assert_eq!(decode_body(&headers_with("identity"), raw.clone()).bytes, raw);
    }

    #[test]
    fn stream_decoder_handles_split_gzip() {
        let payload = b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n".repeat(50);
        let compressed = gzip(&payload);
        let mut decoder = StreamDecoder::for_headers(&HeaderMap::new());

        let mut out = Vec::new();
        for piece in compressed.chunks(7) {
            out.extend_from_slice(&decoder.decode(Bytes::copy_from_slice(piece)));
        }
        out.extend_from_slice(&decoder.finish());
        assert_eq!(out, payload);
    }

    #[test]
    fn stream_decoder_sniffs_across_tiny_chunks() {
        let payload = b"data: {\"z\":1}\n\n".repeat(20);
        let compressed = zstd_bytes(&payload);
        let mut decoder = StreamDecoder::for_headers(&HeaderMap::new());

        let mut out = Vec::new();
        for piece in compressed.chunks(1) {
            out.extend_from_slice(&decoder.decode(Bytes::copy_from_slice(piece)));
        }
        out.extend_from_slice(&decoder.finish());
        assert_eq!(out, payload);
    }

    #[test]
    fn stream_decoder_flushes_short_plain_bodies() {
        let mut decoder = StreamDecoder::for_headers(&HeaderMap::new());
        assert!(decoder.decode(Bytes::from_static(b"ok")).is_empty());
        assert_eq!(decoder.finish().as_ref(), b"ok");
    }

    #[test]
    fn reports_codings_it_cannot_decode() {
        assert_eq!(Encoding::unsupported(&headers_with("br")).as_deref(), Some("br"));
        assert_eq!(Encoding::unsupported(&headers_with("Deflate")).as_deref(), Some("deflate"));
        assert_eq!(Encoding::unsupported(&headers_with("gzip")), None);
        assert_eq!(Encoding::unsupported(&headers_with("identity")), None);
        assert_eq!(Encoding::unsupported(&HeaderMap::new()), None);
    }

    #[test]
    fn stream_decoder_handles_split_zstd() {
        let payload = b"event: ping\ndata: {}\n\n".repeat(40);
        let compressed = zstd_bytes(&payload);
        let mut decoder = StreamDecoder::new(Encoding::Zstd);

        let mut out = Vec::new();
        for piece in compressed.chunks(5) {
            out.extend_from_slice(&decoder.decode(Bytes::copy_from_slice(piece)));
        }
        out.extend_from_slice(&decoder.finish());
        assert_eq!(out, payload);
    }

    #[test]
    fn truncated_gzip_stream_keeps_partial_output() {
        let compressed = gzip(&b"x".repeat(10_000));
        let mut decoder = StreamDecoder::new(Encoding::Gzip);

        let mut out = Vec::new();
        let half = Bytes::copy_from_slice(&compressed[..compressed.len() / 2]);
        out.extend_from_slice(&decoder.decode(half));
        out.extend_from_slice(&decoder.finish());

        assert!(decoder.is_failed());
        assert!(out.len() < 10_000);
        assert!(out.iter().all(|b| *b == b'x'));
        assert!(decoder.decode(Bytes::from_static(b"more")).is_empty());
    }
}
