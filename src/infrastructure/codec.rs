//! Payload Codec
//!
//! Reversible reduction of cache payloads: LZ4 block compression with a
//! prepended size, then base64 so the result stays a string.

use base64::{engine::general_purpose, Engine as _};

/// Payloads shorter than this are stored as-is by default.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
    #[error("payload is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Compression policy for cache payloads.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    enabled: bool,
    threshold: usize,
}

impl PayloadCodec {
    pub fn new(enabled: bool, threshold: usize) -> Self {
        Self { enabled, threshold }
    }

    /// Encode a serialized payload. Returns the stored form and whether it is compressed.
    ///
    /// Compression is kept only when it actually shrinks the payload.
    pub fn encode(&self, raw: String) -> (String, bool) {
        if !self.enabled || raw.len() < self.threshold {
            return (raw, false);
        }

        let compressed = lz4_flex::compress_prepend_size(raw.as_bytes());
        let encoded = general_purpose::STANDARD.encode(compressed);
        if encoded.len() < raw.len() {
            (encoded, true)
        } else {
            (raw, false)
        }
    }

    /// Undo `encode`.
    pub fn decode(&self, stored: &str, compressed: bool) -> Result<String, CodecError> {
        if !compressed {
            return Ok(stored.to_string());
        }

        let bytes = general_purpose::STANDARD.decode(stored)?;
        let raw = lz4_flex::decompress_size_prepended(&bytes)?;
        Ok(String::from_utf8(raw)?)
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(true, DEFAULT_COMPRESSION_THRESHOLD)
    }
}
