//! On-disk asset store.
//!
//! Layout under the data root:
//!   `page_images/{doc_id}/page{NNN}.png`   full-resolution rasterisation
//!   `page_images/{doc_id}/page{NNN}_thumb.jpg`  thumbnail, JPEG q85
//!   `images/{doc_id}/cover.{jpg|png}`      album art for audio documents
//!
//! Every path is keyed by a validated `doc_id` and a whitelisted filename;
//! nothing else is resolvable, which is what keeps the serve path free of
//! traversal.

use image::codecs::jpeg::JpegEncoder;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::ids;

const THUMB_MAX_W: u32 = 300;
const THUMB_MAX_H: u32 = 400;
const THUMB_JPEG_QUALITY: u8 = 85;

pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(root.join("page_images"))?;
        std::fs::create_dir_all(root.join("images"))?;
        Ok(Self { root })
    }

    fn page_dir(&self, doc_id: &str) -> PathBuf {
        self.root.join("page_images").join(doc_id)
    }

    fn art_dir(&self, doc_id: &str) -> PathBuf {
        self.root.join("images").join(doc_id)
    }

    /// Atomic write: tmp file then rename, so a crash never leaves a
    /// half-written asset at the final path.
    fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Persist a page rasterisation and its thumbnail.  Thumbnail generation
    /// failure is non-fatal; the full image is the contract.
    pub fn save_page_image(&self, doc_id: &str, page: usize, png: &[u8]) -> AppResult<PathBuf> {
        let dir = self.page_dir(doc_id);
        let full_path = dir.join(ids::page_image_name(page));
        Self::write_atomic(&full_path, png)?;

        match make_thumbnail(png) {
            Ok(jpeg) => {
                let thumb_path = dir.join(ids::page_thumb_name(page));
                Self::write_atomic(&thumb_path, &jpeg)?;
            }
            Err(e) => {
                warn!(doc_id, page, error = %e, "thumbnail generation failed");
            }
        }

        debug!(doc_id, page, "page image written");
        Ok(full_path)
    }

    /// Persist album art; the extension follows the mime type.
    pub fn save_album_art(&self, doc_id: &str, bytes: &[u8], mime: &str) -> AppResult<PathBuf> {
        let ext = match mime {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            other => {
                return Err(AppError::InvalidInput(format!(
                    "unsupported album art mime type '{}'",
                    other
                )));
            }
        };
        let path = self.art_dir(doc_id).join(format!("cover.{}", ext));
        Self::write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Resolve a serveable asset path.  Both components are validated against
    /// their boundary regexes, and the final path is checked to still live
    /// under the data root.
    pub fn resolve(&self, doc_id: &str, filename: &str) -> AppResult<PathBuf> {
        if !ids::is_valid_doc_id(doc_id) {
            return Err(AppError::InvalidInput(format!("malformed doc_id '{}'", doc_id)));
        }
        if !ids::is_valid_asset_filename(filename) {
            return Err(AppError::InvalidInput(format!(
                "malformed asset filename '{}'",
                filename
            )));
        }

        let dir = if filename.starts_with("cover.") {
            self.art_dir(doc_id)
        } else {
            self.page_dir(doc_id)
        };
        let path = dir.join(filename);

        if !path.exists() {
            return Err(AppError::NotFound(format!("{}/{}", doc_id, filename)));
        }

        let canonical = dunce::canonicalize(&path)?;
        let root = dunce::canonicalize(&self.root)?;
        if !canonical.starts_with(&root) {
            return Err(AppError::AccessDenied(format!("{}/{}", doc_id, filename)));
        }
        Ok(canonical)
    }

    /// Count full-resolution page images on disk for a document.
    pub fn count_pages(&self, doc_id: &str) -> usize {
        let dir = self.page_dir(doc_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("page") && name.ends_with(".png")
            })
            .count()
    }

    /// Remove all page images and thumbnails for a document.
    /// Returns the number of full pages that were present.
    pub fn delete_pages(&self, doc_id: &str) -> AppResult<usize> {
        let count = self.count_pages(doc_id);
        let dir = self.page_dir(doc_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(count)
    }

    /// Remove album art.  Returns whether any existed.
    pub fn delete_album_art(&self, doc_id: &str) -> AppResult<bool> {
        let dir = self.art_dir(doc_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Thumbnail URL for the first page, if one exists.
    pub fn thumbnail_url(&self, doc_id: &str) -> Option<String> {
        let name = ids::page_thumb_name(1);
        if self.page_dir(doc_id).join(&name).exists() {
            Some(format!("/assets/{}/{}", doc_id, name))
        } else {
            None
        }
    }
}

/// Decode a PNG page and produce a letterboxed JPEG thumbnail that fits
/// within 300x400, preserving aspect ratio.
fn make_thumbnail(png: &[u8]) -> AppResult<Vec<u8>> {
    let img = image::load_from_memory(png)
        .map_err(|e| AppError::InvalidInput(format!("unreadable page image: {}", e)))?;
    let thumb = img.thumbnail(THUMB_MAX_W, THUMB_MAX_H).to_rgb8();

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), THUMB_JPEG_QUALITY);
    thumb
        .write_with_encoder(encoder)
        .map_err(|e| AppError::InvalidInput(format!("thumbnail encode failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc_id() -> String {
        "a".repeat(64)
    }

    fn sample_png() -> Vec<u8> {
        // 2x2 opaque red square.
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 0]));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn save_and_resolve_page_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path()).unwrap();
        let doc_id = sample_doc_id();

        store.save_page_image(&doc_id, 1, &sample_png()).unwrap();

        assert!(store.resolve(&doc_id, "page001.png").is_ok());
        assert!(store.resolve(&doc_id, "page001_thumb.jpg").is_ok());
        assert_eq!(store.count_pages(&doc_id), 1);
        assert_eq!(
            store.thumbnail_url(&doc_id).unwrap(),
            format!("/assets/{}/page001_thumb.jpg", doc_id)
        );
    }

    #[test]
    fn resolve_rejects_bad_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path()).unwrap();

        assert!(matches!(
            store.resolve("not-hex!", "page001.png"),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            store.resolve(&sample_doc_id(), "../../secret.png"),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            store.resolve(&sample_doc_id(), "page001.png"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn album_art_mime_routing() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path()).unwrap();
        let doc_id = sample_doc_id();

        let path = store
            .save_album_art(&doc_id, &sample_png(), "image/png")
            .unwrap();
        assert!(path.ends_with("cover.png"));
        assert!(store.resolve(&doc_id, "cover.png").is_ok());

        assert!(store
            .save_album_art(&doc_id, b"gifdata", "image/gif")
            .is_err());
    }

    #[test]
    fn delete_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path()).unwrap();
        let doc_id = sample_doc_id();

        store.save_page_image(&doc_id, 1, &sample_png()).unwrap();
        store.save_page_image(&doc_id, 2, &sample_png()).unwrap();
        store
            .save_album_art(&doc_id, &sample_png(), "image/jpeg")
            .unwrap();

        assert_eq!(store.delete_pages(&doc_id).unwrap(), 2);
        assert!(store.delete_album_art(&doc_id).unwrap());
        assert_eq!(store.count_pages(&doc_id), 0);
        assert!(!store.delete_album_art(&doc_id).unwrap());
    }

    #[test]
    fn thumbnail_fits_bounds() {
        let img = image::RgbImage::from_pixel(900, 1600, image::Rgb([10, 20, 30]));
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let jpeg = make_thumbnail(&png).unwrap();
        let thumb = image::load_from_memory(&jpeg).unwrap();
        assert!(thumb.width() <= THUMB_MAX_W);
        assert!(thumb.height() <= THUMB_MAX_H);
    }
}
