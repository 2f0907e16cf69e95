//! Document and embedding identifier model.
//!
//! Every artefact key in the system derives from a `doc_id`: a lowercase
//! SHA-256 hex digest.  The derivation is a pure function of the upload's
//! canonical name so that identical uploads collide into the same id, which
//! is what duplicate detection and in-flight collapsing rely on.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Canonical ids are 64 hex chars; the read path tolerates legacy ids down
/// to 8 chars.
static DOC_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-f0-9]{8,64}$").unwrap());

/// Only these filenames may be served from the asset store.
static ASSET_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(page\d{3}(_thumb)?\.(png|jpg)|cover\.(jpg|png))$").unwrap());

/// Derive the canonical `doc_id` for an upload: a pure function of the
/// upload's name and a content-derived tag (the object's eTag as reported by
/// the store, or a real content hash).
///
/// Re-uploading identical content under the same name collides into the same
/// document; the same name with different content yields a distinct id.
pub fn derive_doc_id(filename: &str, content_tag: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(basename(filename).as_bytes());
    hasher.update(b"\n");
    hasher.update(content_tag.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pre-upload form of the id: before the object exists there is no content
/// to hash, so identity falls back to `filename+ts`.
pub fn derive_provisional_doc_id(filename: &str, upload_ts: i64) -> String {
    derive_doc_id(filename, &format!("ts:{}", upload_ts))
}

/// S3 eTags arrive quoted (`"d41d8cd9..."`); strip the quotes so equal
/// content yields equal tags regardless of the store's framing.
pub fn normalize_etag(etag: &str) -> &str {
    etag.trim_matches('"')
}

/// Strip any directory components from an object key.
pub fn basename(key: &str) -> &str {
    key.rsplit(['/', '\\']).next().unwrap_or(key)
}

pub fn is_valid_doc_id(id: &str) -> bool {
    DOC_ID_RE.is_match(id)
}

pub fn is_valid_asset_filename(name: &str) -> bool {
    ASSET_FILENAME_RE.is_match(name)
}

pub fn chunk_id(doc_id: &str, index: usize) -> String {
    format!("chunk_{}_{}", doc_id, index)
}

/// `visual_{doc_id}_{page:03}` — one per rasterised page.
pub fn visual_embedding_id(doc_id: &str, page: usize) -> String {
    format!("visual_{}_{:03}", doc_id, page)
}

/// `text_{chunk_id}` — one per text chunk.
pub fn text_embedding_id(chunk_id: &str) -> String {
    format!("text_{}", chunk_id)
}

pub fn element_id(page: usize, idx: usize) -> String {
    format!("elem_{}_{}", page, idx)
}

pub fn page_image_name(page: usize) -> String {
    format!("page{:03}.png", page)
}

pub fn page_thumb_name(page: usize) -> String {
    format!("page{:03}_thumb.jpg", page)
}

/// Validate an object key from the event surface.  Keys must be relative,
/// non-empty and free of parent traversal.
pub fn validate_object_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('/')
        && !key.split(['/', '\\']).any(|seg| seg == ".." || seg.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_is_64_hex_and_deterministic() {
        let a = derive_doc_id("q4.pdf", "etag-abc123");
        let b = derive_doc_id("q4.pdf", "etag-abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(is_valid_doc_id(&a));
    }

    #[test]
    fn doc_id_distinguishes_content() {
        // Same filename, different content: two distinct documents.
        let a = derive_doc_id("q4.pdf", "etag-one");
        let b = derive_doc_id("q4.pdf", "etag-two");
        assert_ne!(a, b);
    }

    #[test]
    fn doc_id_ignores_key_prefix() {
        assert_eq!(
            derive_doc_id("2024/reports/q4.pdf", "t"),
            derive_doc_id("q4.pdf", "t")
        );
    }

    #[test]
    fn provisional_doc_id_uses_timestamp() {
        let a = derive_provisional_doc_id("q4.pdf", 1_700_000_000);
        let b = derive_provisional_doc_id("q4.pdf", 1_700_000_000);
        let c = derive_provisional_doc_id("q4.pdf", 1_700_000_001);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(is_valid_doc_id(&a));
    }

    #[test]
    fn etag_normalisation() {
        assert_eq!(normalize_etag("\"abc123\""), "abc123");
        assert_eq!(normalize_etag("abc123"), "abc123");
        assert_eq!(
            derive_doc_id("a.pdf", normalize_etag("\"x\"")),
            derive_doc_id("a.pdf", normalize_etag("x"))
        );
    }

    #[test]
    fn doc_id_validation_bounds() {
        assert!(is_valid_doc_id("abcdef01")); // legacy 8-char
        assert!(is_valid_doc_id(&"a".repeat(64)));
        assert!(!is_valid_doc_id("abcdef0")); // too short
        assert!(!is_valid_doc_id(&"a".repeat(65)));
        assert!(!is_valid_doc_id("ABCDEF0123")); // uppercase rejected
        assert!(!is_valid_doc_id("../../etc/passwd"));
    }

    #[test]
    fn asset_filename_validation() {
        assert!(is_valid_asset_filename("page001.png"));
        assert!(is_valid_asset_filename("page042_thumb.jpg"));
        assert!(is_valid_asset_filename("cover.jpg"));
        assert!(is_valid_asset_filename("cover.png"));
        assert!(!is_valid_asset_filename("page1.png")); // must be three digits
        assert!(!is_valid_asset_filename("page001.gif"));
        assert!(!is_valid_asset_filename("cover.webp"));
        assert!(!is_valid_asset_filename("../page001.png"));
    }

    #[test]
    fn embedding_id_formats() {
        let doc = "a".repeat(64);
        assert_eq!(
            visual_embedding_id(&doc, 3),
            format!("visual_{}_003", doc)
        );
        let cid = chunk_id(&doc, 7);
        assert_eq!(cid, format!("chunk_{}_7", doc));
        assert_eq!(text_embedding_id(&cid), format!("text_{}", cid));
    }

    #[test]
    fn object_key_validation() {
        assert!(validate_object_key("q4.pdf"));
        assert!(validate_object_key("reports/q4.pdf"));
        assert!(!validate_object_key(""));
        assert!(!validate_object_key("/etc/passwd"));
        assert!(!validate_object_key("a/../b.pdf"));
        assert!(!validate_object_key("a//b.pdf"));
    }
}
