//! Envelope codec: JSON text frames or Brotli-compressed binary frames.
//!
//! Compression is best-effort on the way out. If the compressor fails the
//! message goes out as an uncompressed text frame carrying the same JSON.

use std::io::{Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::{Frame, InboundMessage, OutboundMessage};

/// Highest Brotli quality level.
pub const MAX_QUALITY: u32 = 11;

/// Brotli window size (log2).
const BROTLI_LGWIN: u32 = 22;

/// Internal buffer size for the Brotli reader/writer.
const BROTLI_BUFFER: usize = 4096;

/// Default cap on decompressed frame size (64 MiB).
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: usize = 64 << 20;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Compression failed: {0}")]
    Compression(String),
    #[error("Decompression failed: {0}")]
    Decompression(String),
    #[error("Binary frame received but no decompressor is available")]
    CompressionUnavailable,
    #[error("Decompressed frame exceeds {0} bytes")]
    TooLarge(usize),
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Byte-level compression backend.
pub trait Compression: Send + Sync {
    /// Compress `data` at the given quality level.
    ///
    /// # Errors
    /// Returns error if the backend rejects the input or quality.
    fn compress(&self, data: &[u8], quality: u32) -> Result<Vec<u8>, CodecError>;

    /// Decompress `data`, producing at most `limit` bytes.
    ///
    /// # Errors
    /// Returns error on corrupt input or when the output exceeds `limit`.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError>;
}

/// Brotli compression backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Brotli;

impl Compression for Brotli {
    fn compress(&self, data: &[u8], quality: u32) -> Result<Vec<u8>, CodecError> {
        if quality == 0 || quality > MAX_QUALITY {
            return Err(CodecError::Compression(format!(
                "quality {quality} out of range 1..={MAX_QUALITY}"
            )));
        }
        let mut writer =
            brotli::CompressorWriter::new(Vec::new(), BROTLI_BUFFER, quality, BROTLI_LGWIN);
        writer
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(writer.into_inner())
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
        let reader = brotli::Decompressor::new(data, BROTLI_BUFFER);
        let mut out = Vec::with_capacity(data.len().saturating_mul(4).min(limit));
        reader
            .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        if out.len() > limit {
            return Err(CodecError::TooLarge(limit));
        }
        Ok(out)
    }
}

/// Encodes outbound messages and decodes inbound frames.
#[derive(Clone)]
pub struct EnvelopeCodec {
    compression: Option<Arc<dyn Compression>>,
    max_decompressed_bytes: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("compression", &self.compression.is_some())
            .field("max_decompressed_bytes", &self.max_decompressed_bytes)
            .finish()
    }
}

impl EnvelopeCodec {
    /// Codec backed by Brotli.
    #[must_use]
    pub fn new() -> Self {
        Self::with_compression(Arc::new(Brotli))
    }

    /// Codec backed by a custom compression backend.
    #[must_use]
    pub fn with_compression(compression: Arc<dyn Compression>) -> Self {
        Self {
            compression: Some(compression),
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }

    /// Codec without compression: every send is text, binary frames fail to decode.
    #[must_use]
    pub fn uncompressed() -> Self {
        Self {
            compression: None,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }

    /// Set the decompressed size cap.
    #[must_use]
    pub const fn with_max_decompressed_bytes(mut self, limit: usize) -> Self {
        self.max_decompressed_bytes = limit;
        self
    }

    /// Whether a compression backend is available.
    #[must_use]
    pub fn can_compress(&self) -> bool {
        self.compression.is_some()
    }

    /// Encode an outbound message.
    ///
    /// `quality` of `None` or `Some(0)` sends uncompressed text.
    ///
    /// # Errors
    /// Returns error only if the message cannot be serialized.
    pub fn encode(
        &self,
        msg: &OutboundMessage,
        quality: Option<u32>,
    ) -> Result<Frame, CodecError> {
        let json = serde_json::to_string(msg)?;

        let (Some(quality), Some(compression)) =
            (quality.filter(|q| *q > 0), self.compression.as_ref())
        else {
            return Ok(Frame::Text(json));
        };

        match compression.compress(json.as_bytes(), quality) {
            Ok(bytes) => Ok(Frame::Binary(bytes)),
            Err(e) => {
                tracing::warn!(cmd = %msg.command, "compression failed, sending uncompressed: {e}");
                Ok(Frame::Text(json))
            }
        }
    }

    /// Decode an inbound frame.
    ///
    /// # Errors
    /// Returns error if the frame cannot be decompressed or parsed.
    pub fn decode(&self, frame: &Frame) -> Result<InboundMessage, CodecError> {
        match frame {
            Frame::Text(text) => Ok(serde_json::from_str(text)?),
            Frame::Binary(bytes) => {
                let compression = self
                    .compression
                    .as_ref()
                    .ok_or(CodecError::CompressionUnavailable)?;
                let raw = compression.decompress(bytes, self.max_decompressed_bytes)?;
                let text = String::from_utf8(raw)?;
                Ok(serde_json::from_str(&text)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::Value;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    struct FailingCompression;

    impl Compression for FailingCompression {
        fn compress(&self, _data: &[u8], _quality: u32) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Compression("boom".into()))
        }

        fn decompress(&self, _data: &[u8], _limit: usize) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Decompression("boom".into()))
        }
    }

    fn sample() -> OutboundMessage {
        let mut payload = HashMap::new();
        payload.insert("messageId".to_string(), "abc".to_string());
        payload.insert("message".to_string(), "hello there".to_string());
        OutboundMessage::new("SendUserMessage", payload, "id-1")
    }

    fn brotli_frame(json: &str) -> Frame {
        Frame::Binary(Brotli.compress(json.as_bytes(), 5).unwrap())
    }

    #[test]
    fn test_encode_without_quality_is_text() {
        let codec = EnvelopeCodec::new();
        let frame = codec.encode(&sample(), None).unwrap();
        assert!(matches!(frame, Frame::Text(_)));

        let frame = codec.encode(&sample(), Some(0)).unwrap();
        assert!(matches!(frame, Frame::Text(_)));
    }

    #[test]
    fn test_encode_with_quality_is_brotli() {
        let codec = EnvelopeCodec::new();
        let frame = codec.encode(&sample(), Some(4)).unwrap();
        let Frame::Binary(bytes) = frame else {
            panic!("expected binary frame");
        };

        let raw = Brotli.decompress(&bytes, 1 << 20).unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["cmd"], "SendUserMessage");
        assert_eq!(value["request_user_access_id"], "id-1");
    }

    #[test]
    fn test_compression_failure_falls_back_to_text() {
        let codec = EnvelopeCodec::with_compression(Arc::new(FailingCompression));
        let frame = codec.encode(&sample(), Some(4)).unwrap();

        let Frame::Text(text) = frame else {
            panic!("expected text fallback");
        };
        let sent: OutboundMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(sent, sample());
    }

    #[test]
    fn test_out_of_range_quality_falls_back_to_text() {
        let codec = EnvelopeCodec::new();
        let frame = codec.encode(&sample(), Some(MAX_QUALITY + 1)).unwrap();
        assert!(matches!(frame, Frame::Text(_)));
    }

    #[test]
    fn test_uncompressed_codec_ignores_quality() {
        let codec = EnvelopeCodec::uncompressed();
        assert!(!codec.can_compress());
        let frame = codec.encode(&sample(), Some(4)).unwrap();
        assert!(matches!(frame, Frame::Text(_)));
    }

    #[test]
    fn test_decode_text_and_binary_agree() {
        let json = r#"{"cmd":"SendUserMessage","status":200,"ok":true,"data":{"messageId":"abc","llmResponse":"Hel"}}"#;
        let codec = EnvelopeCodec::new();

        let from_text = assert_ok!(codec.decode(&Frame::Text(json.to_string())));
        let from_binary = assert_ok!(codec.decode(&brotli_frame(json)));
        assert_eq!(from_text, from_binary);
        assert_eq!(from_text.data_str("llmResponse").as_deref(), Some("Hel"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = EnvelopeCodec::new();
        assert_err!(codec.decode(&Frame::Text("not json".into())));
        assert_err!(codec.decode(&Frame::Binary(vec![0xff, 0x00, 0x13, 0x37])));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let codec = EnvelopeCodec::new();
        let frame = Frame::Binary(Brotli.compress(&[0xc3, 0x28], 5).unwrap());
        assert!(matches!(codec.decode(&frame), Err(CodecError::Utf8(_))));
    }

    #[test]
    fn test_decode_binary_without_backend() {
        let codec = EnvelopeCodec::uncompressed();
        let result = codec.decode(&brotli_frame(r#"{"cmd":"x"}"#));
        assert!(matches!(result, Err(CodecError::CompressionUnavailable)));
    }

    #[test]
    fn test_decompressed_size_cap() {
        let json = format!(r#"{{"cmd":"x","message":"{}"}}"#, "a".repeat(4096));
        let codec = EnvelopeCodec::new().with_max_decompressed_bytes(1024);
        let result = codec.decode(&brotli_frame(&json));
        assert!(matches!(result, Err(CodecError::TooLarge(1024))));
    }

    #[test]
    fn test_unbounded_size_cap_decodes() {
        let json = r#"{"cmd":"SendUserMessage","ok":true}"#;
        let codec = EnvelopeCodec::new().with_max_decompressed_bytes(usize::MAX);
        let msg = assert_ok!(codec.decode(&brotli_frame(json)));
        assert_eq!(msg.cmd, "SendUserMessage");
    }
}
