//! Compressed sidecar payloads.
//!
//! Bulky content (full-document markdown, per-page structure, multi-vector
//! tensors) rides alongside the primary vector data as gzip+base64 blobs in
//! embedding metadata, tagged by a `*_compression` discriminator so readers
//! can tell the two forms apart.  Gzip's trailing CRC32 is the integrity
//! check: a corrupted blob fails to decode and is reported as
//! `AppError::Corrupted` rather than yielding garbage.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};

use crate::config::MARKDOWN_MAX_BYTES;
use crate::error::{AppError, AppResult};

/// Metadata key for markdown stored inline (small documents).
pub const MARKDOWN_INLINE_KEY: &str = "full_markdown";
/// Metadata key for gzip+base64 markdown.
pub const MARKDOWN_COMPRESSED_KEY: &str = "full_markdown_compressed";
/// Discriminator key; values are [`COMPRESSION_NONE`] or [`COMPRESSION_GZIP_B64`].
pub const MARKDOWN_COMPRESSION_KEY: &str = "markdown_compression";
pub const COMPRESSION_NONE: &str = "none";
pub const COMPRESSION_GZIP_B64: &str = "gzip+base64";

/// Metadata key for the per-page structure blob.
pub const STRUCTURE_COMPRESSED_KEY: &str = "page_structure_compressed";

pub fn gzip_compress(data: &[u8]) -> AppResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gzip_decompress(data: &[u8]) -> AppResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AppError::Corrupted(format!("gzip decode failed: {}", e)))?;
    Ok(out)
}

pub fn compress_to_b64(data: &[u8]) -> AppResult<String> {
    Ok(B64.encode(gzip_compress(data)?))
}

pub fn decompress_from_b64(blob: &str) -> AppResult<Vec<u8>> {
    let raw = B64
        .decode(blob)
        .map_err(|e| AppError::Corrupted(format!("base64 decode failed: {}", e)))?;
    gzip_decompress(&raw)
}

/// The two persisted forms of full-document markdown.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkdownPayload {
    Inline(String),
    Compressed(String),
}

impl MarkdownPayload {
    pub fn compression(&self) -> &'static str {
        match self {
            MarkdownPayload::Inline(_) => COMPRESSION_NONE,
            MarkdownPayload::Compressed(_) => COMPRESSION_GZIP_B64,
        }
    }

    pub fn metadata_key(&self) -> &'static str {
        match self {
            MarkdownPayload::Inline(_) => MARKDOWN_INLINE_KEY,
            MarkdownPayload::Compressed(_) => MARKDOWN_COMPRESSED_KEY,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            MarkdownPayload::Inline(s) | MarkdownPayload::Compressed(s) => s,
        }
    }
}

/// Encode markdown per the sidecar policy: inline at or below the threshold,
/// gzip+base64 above it, hard reject past [`MARKDOWN_MAX_BYTES`].
pub fn encode_markdown(markdown: &str, inline_threshold: usize) -> AppResult<MarkdownPayload> {
    let len = markdown.len();
    if len > MARKDOWN_MAX_BYTES {
        return Err(AppError::MarkdownTooLarge(len));
    }
    if len <= inline_threshold {
        Ok(MarkdownPayload::Inline(markdown.to_string()))
    } else {
        Ok(MarkdownPayload::Compressed(compress_to_b64(
            markdown.as_bytes(),
        )?))
    }
}

/// Decode a markdown payload back to text given the stored discriminator.
pub fn decode_markdown(compression: &str, value: &str) -> AppResult<String> {
    match compression {
        COMPRESSION_NONE => Ok(value.to_string()),
        COMPRESSION_GZIP_B64 => {
            let bytes = decompress_from_b64(value)?;
            String::from_utf8(bytes)
                .map_err(|_| AppError::Corrupted("markdown blob is not valid UTF-8".into()))
        }
        other => Err(AppError::Corrupted(format!(
            "unknown markdown_compression '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_is_bit_exact() {
        let samples = [
            "",
            "# Title\n\nplain ascii body",
            "unicode: żółć, 中文, עברית",
            "emoji: 🔍📄🧪 and a tab\tand\r\nCRLF",
        ];
        for s in samples {
            let blob = compress_to_b64(s.as_bytes()).unwrap();
            assert_eq!(decompress_from_b64(&blob).unwrap(), s.as_bytes());
        }
    }

    #[test]
    fn compression_is_deterministic() {
        let body = "determinism check ".repeat(500);
        let a = compress_to_b64(body.as_bytes()).unwrap();
        let b = compress_to_b64(body.as_bytes()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn one_mib_ratio_and_roundtrip() {
        let md = format!("# T\n{}", "x".repeat(1_048_576));
        let compressed = gzip_compress(md.as_bytes()).unwrap();
        assert!(compressed.len() * 3 <= md.len(), "compression ratio below 3x");
        assert_eq!(gzip_decompress(&compressed).unwrap(), md.as_bytes());
    }

    #[test]
    fn markdown_size_cap() {
        let at_cap = "x".repeat(MARKDOWN_MAX_BYTES);
        assert!(matches!(
            encode_markdown(&at_cap, 1024),
            Ok(MarkdownPayload::Compressed(_))
        ));

        let over_cap = "x".repeat(MARKDOWN_MAX_BYTES + 1);
        assert!(matches!(
            encode_markdown(&over_cap, 1024),
            Err(AppError::MarkdownTooLarge(_))
        ));
    }

    #[test]
    fn inline_threshold_selects_form() {
        let small = "short";
        match encode_markdown(small, 1024).unwrap() {
            MarkdownPayload::Inline(s) => assert_eq!(s, small),
            other => panic!("expected inline, got {:?}", other),
        }

        let big = "y".repeat(2048);
        let payload = encode_markdown(&big, 1024).unwrap();
        assert!(matches!(payload, MarkdownPayload::Compressed(_)));
        assert_eq!(payload.compression(), COMPRESSION_GZIP_B64);
        assert_eq!(
            decode_markdown(payload.compression(), payload.value()).unwrap(),
            big
        );
    }

    #[test]
    fn corrupted_blob_is_detected() {
        let blob = compress_to_b64(b"hello sidecar").unwrap();
        let mut raw = B64.decode(&blob).unwrap();
        // Flip a byte in the deflate stream, keeping the gzip header intact.
        let mid = raw.len() / 2;
        raw[mid] ^= 0xff;
        let tampered = B64.encode(&raw);
        assert!(matches!(
            decompress_from_b64(&tampered),
            Err(AppError::Corrupted(_))
        ));
    }

    #[test]
    fn unknown_compression_flag_rejected() {
        assert!(matches!(
            decode_markdown("zstd", "abc"),
            Err(AppError::Corrupted(_))
        ));
    }
}
