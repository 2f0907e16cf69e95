//! Structure and bounding-box service.
//!
//! Turns the parser's raw layout output into typed per-page structures with
//! validated bounding boxes, maps chunks to the elements they came from, and
//! serves the compressed structure blobs through a small in-process LRU
//! backed by vector-store metadata for durability.
//!
//! Coordinates are PDF points: origin bottom-left, y increases upward.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::ids;
use crate::parser::{RawPageLayout, TextChunk};
use crate::sidecar;
use crate::vector_store::{Collection, VectorStoreClient};

pub const METADATA_VERSION_LEGACY: &str = "0.0";
pub const METADATA_VERSION_STRUCTURED: &str = "1.0";

/// Element preview text is capped to keep structure blobs small.
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl BBox {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self { left, bottom, right, top }
    }

    /// Invariants: `left < right`, `bottom < top`, fully inside the page.
    pub fn is_valid(&self, page_width: f64, page_height: f64) -> bool {
        self.left < self.right
            && self.bottom < self.top
            && self.left >= 0.0
            && self.right <= page_width
            && self.bottom >= 0.0
            && self.top <= page_height
    }

    pub fn rounded(&self, precision: u32) -> Self {
        let factor = 10f64.powi(precision as i32);
        let round = |v: f64| (v * factor).round() / factor;
        Self {
            left: round(self.left),
            bottom: round(self.bottom),
            right: round(self.right),
            top: round(self.top),
        }
    }

    /// Tightest rectangle enclosing `self` and `other`.
    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            left: self.left.min(other.left),
            bottom: self.bottom.min(other.bottom),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
        }
    }

    /// `l,b,r,t` rendering used in markdown chunk markers.
    pub fn to_marker(&self) -> String {
        format!("{},{},{},{}", self.left, self.bottom, self.right, self.top)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Heading,
    Paragraph,
    List,
    Table,
    Figure,
    Code,
    Quote,
    Caption,
    Footer,
    Header,
}

impl ElementType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heading" => Some(Self::Heading),
            "paragraph" => Some(Self::Paragraph),
            "list" => Some(Self::List),
            "table" => Some(Self::Table),
            "figure" => Some(Self::Figure),
            "code" => Some(Self::Code),
            "quote" => Some(Self::Quote),
            "caption" => Some(Self::Caption),
            "footer" => Some(Self::Footer),
            "header" => Some(Self::Header),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureElement {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub bbox: BBox,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub page: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStructure {
    pub page: usize,
    pub page_width: f64,
    pub page_height: f64,
    pub elements: Vec<StructureElement>,
    pub metadata_version: String,
    pub has_structure: bool,
}

impl PageStructure {
    pub fn empty(page: usize) -> Self {
        Self {
            page,
            page_width: 0.0,
            page_height: 0.0,
            elements: Vec::new(),
            metadata_version: METADATA_VERSION_LEGACY.to_string(),
            has_structure: false,
        }
    }
}

/// Build validated page structures from the parser's raw layout and link
/// chunks to their source elements (both directions).
///
/// Elements below the confidence floor, or with inverted/out-of-page boxes,
/// are dropped.  A chunk spanning several surviving elements receives the
/// tightest enclosing rectangle of their boxes.
pub fn build_page_structures(
    layout: &[RawPageLayout],
    chunks: &mut [TextChunk],
    min_confidence: f64,
    precision: u32,
) -> Vec<PageStructure> {
    let mut pages = Vec::with_capacity(layout.len());
    // parser element index -> (kept element id, bbox, page)
    let mut kept: std::collections::HashMap<String, (String, BBox)> =
        std::collections::HashMap::new();

    for raw_page in layout {
        let mut elements = Vec::new();
        for (raw_idx, raw) in raw_page.elements.iter().enumerate() {
            if raw.confidence < min_confidence {
                continue;
            }
            let Some(element_type) = ElementType::parse(&raw.element_type) else {
                warn!(page = raw_page.page, kind = %raw.element_type, "unknown element type dropped");
                continue;
            };
            let bbox = BBox::new(raw.bbox[0], raw.bbox[1], raw.bbox[2], raw.bbox[3]);
            if !bbox.is_valid(raw_page.width, raw_page.height) {
                continue;
            }
            let bbox = bbox.rounded(precision);
            let id = ids::element_id(raw_page.page, elements.len());
            // Parser references elements as `elem_{page}_{raw_idx}`; remember
            // both so chunk links survive element filtering.
            kept.insert(
                ids::element_id(raw_page.page, raw_idx),
                (id.clone(), bbox),
            );
            elements.push(StructureElement {
                id,
                element_type,
                bbox,
                text: truncate_preview(&raw.text),
                chunk_id: None,
                page: raw_page.page,
                confidence: raw.confidence,
            });
        }
        pages.push(PageStructure {
            page: raw_page.page,
            page_width: raw_page.width,
            page_height: raw_page.height,
            elements,
            metadata_version: METADATA_VERSION_STRUCTURED.to_string(),
            has_structure: true,
        });
    }

    // Chunk → element: inherit (or enclose) the source boxes; element →
    // chunk: backlink each spanned element.
    for chunk in chunks.iter_mut() {
        let mut resolved: Vec<(String, BBox)> = Vec::new();
        for raw_ref in &chunk.element_ids {
            if let Some((id, bbox)) = kept.get(raw_ref) {
                resolved.push((id.clone(), *bbox));
            }
        }
        chunk.element_ids = resolved.iter().map(|(id, _)| id.clone()).collect();
        if !resolved.is_empty() {
            for page in pages.iter_mut() {
                if page.page != chunk.page {
                    continue;
                }
                for element in page.elements.iter_mut() {
                    if chunk.element_ids.contains(&element.id) {
                        element.chunk_id = Some(chunk.chunk_id.clone());
                    }
                }
            }
        }
    }

    pages
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Mapped bbox for a chunk, computed from the structures it references.
pub fn chunk_bbox(chunk: &TextChunk, pages: &[PageStructure]) -> Option<BBox> {
    let page = pages.iter().find(|p| p.page == chunk.page)?;
    page.elements
        .iter()
        .filter(|e| chunk.element_ids.contains(&e.id))
        .map(|e| e.bbox)
        .reduce(|acc, b| acc.union(&b))
}

// ---------------------------------------------------------------------------
// Cache-backed service
// ---------------------------------------------------------------------------

fn cache_key(doc_id: &str, page: usize) -> String {
    format!("{}:page:{}", doc_id, page)
}

pub struct StructureService {
    cache: Mutex<LruCache<String, Arc<PageStructure>>>,
    store: Arc<VectorStoreClient>,
}

impl StructureService {
    pub fn new(store: Arc<VectorStoreClient>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            store,
        }
    }

    pub fn insert(&self, doc_id: &str, structure: PageStructure) {
        self.cache
            .lock()
            .put(cache_key(doc_id, structure.page), Arc::new(structure));
    }

    /// Fetch a page structure, falling back to the durable compressed blob in
    /// the vector store on cache miss.  Corrupted blobs return `None` after
    /// logging; a missing blob also returns `None`.
    pub async fn get(&self, doc_id: &str, page: usize) -> AppResult<Option<Arc<PageStructure>>> {
        if let Some(hit) = self.cache.lock().get(&cache_key(doc_id, page)) {
            return Ok(Some(hit.clone()));
        }

        let blob = self.load_blob(doc_id, page).await?;
        let Some(blob) = blob else {
            return Ok(None);
        };

        let structure: PageStructure = match sidecar::decompress_from_b64(&blob)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(AppError::from))
        {
            Ok(s) => s,
            Err(e) => {
                warn!(doc_id, page, error = %e, "corrupted structure blob");
                return Ok(None);
            }
        };

        let arc = Arc::new(structure);
        self.cache
            .lock()
            .put(cache_key(doc_id, page), arc.clone());
        Ok(Some(arc))
    }

    async fn load_blob(&self, doc_id: &str, page: usize) -> AppResult<Option<String>> {
        // Visual documents carry the blob on the page's visual embedding;
        // text-only documents on the first chunk embedding of the page.
        let visual_id = ids::visual_embedding_id(doc_id, page);
        let visual = match self.store.get(Collection::Visual, &visual_id).await {
            Ok(v) => v,
            // A corrupt multi-vector on the page must not block structure reads.
            Err(AppError::Corrupted(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some((_, metadata)) = visual {
            if let Some(blob) = metadata
                .get(sidecar::STRUCTURE_COMPRESSED_KEY)
                .and_then(|v| v.as_str())
            {
                return Ok(Some(blob.to_string()));
            }
        }

        let filter = json!({ "$and": [ { "doc_id": doc_id }, { "page": page } ] });
        let candidates = self.store.get_where(Collection::Text, &filter, 8).await?;
        for candidate in candidates {
            if let Some(blob) = candidate
                .metadata
                .get(sidecar::STRUCTURE_COMPRESSED_KEY)
                .and_then(|v| v.as_str())
            {
                return Ok(Some(blob.to_string()));
            }
        }
        Ok(None)
    }

    /// Drop all cached entries for a document.  Returns how many were evicted.
    pub fn evict_doc(&self, doc_id: &str) -> usize {
        let prefix = format!("{}:page:", doc_id);
        let mut cache = self.cache.lock();
        let keys: Vec<String> = cache
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| k.starts_with(&prefix))
            .collect();
        for key in &keys {
            cache.pop(key);
        }
        keys.len()
    }
}

/// Serialise a page structure to its compressed sidecar form.
pub fn compress_structure(structure: &PageStructure) -> AppResult<String> {
    let bytes = serde_json::to_vec(structure)?;
    sidecar::compress_to_b64(&bytes)
}

// ---------------------------------------------------------------------------
// Markdown chunk markers
// ---------------------------------------------------------------------------

/// One chunk's marker data, however it was sourced (freshly parsed chunks or
/// metadata read back from the vector store).
#[derive(Debug, Clone)]
pub struct ChunkMarker {
    pub chunk_id: String,
    pub page: usize,
    pub bbox: String,
    pub text: String,
}

/// Wrap each chunk's text in the markdown with invisible HTML-comment
/// markers carrying the chunk id, page and mapped bbox.  Chunks whose text
/// cannot be located are left unmarked.
pub fn annotate_markdown(markdown: &str, markers: &[ChunkMarker]) -> String {
    let mut out = String::with_capacity(markdown.len() + markers.len() * 64);
    let mut cursor = 0usize;

    for marker in markers {
        let needle = marker.text.trim();
        if needle.is_empty() {
            continue;
        }
        let Some(rel) = markdown[cursor..].find(needle) else {
            continue;
        };
        let start = cursor + rel;
        let end = start + needle.len();

        out.push_str(&markdown[cursor..start]);
        out.push_str(&format!(
            "<!-- CHUNK_START: {}, PAGE: {}, BBOX: {} -->",
            marker.chunk_id, marker.page, marker.bbox
        ));
        out.push_str(needle);
        out.push_str(&format!("<!-- CHUNK_END: {} -->", marker.chunk_id));
        cursor = end;
    }

    out.push_str(&markdown[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RawLayoutElement;

    fn raw_element(kind: &str, bbox: [f64; 4], confidence: f64) -> RawLayoutElement {
        RawLayoutElement {
            element_type: kind.to_string(),
            bbox,
            text: "sample text".to_string(),
            confidence,
        }
    }

    fn one_page_layout(elements: Vec<RawLayoutElement>) -> Vec<RawPageLayout> {
        vec![RawPageLayout {
            page: 1,
            width: 612.0,
            height: 792.0,
            elements,
        }]
    }

    fn chunk_for(doc_id: &str, index: usize, element_ids: Vec<String>) -> TextChunk {
        TextChunk {
            chunk_id: ids::chunk_id(doc_id, index),
            doc_id: doc_id.to_string(),
            page: 1,
            index,
            text: format!("chunk {}", index),
            element_ids,
            element_type: None,
            section_heading: None,
            prev_chunk_id: None,
            next_chunk_id: None,
        }
    }

    #[test]
    fn bbox_invariants() {
        assert!(BBox::new(10.0, 10.0, 100.0, 50.0).is_valid(612.0, 792.0));
        // inverted x
        assert!(!BBox::new(100.0, 10.0, 10.0, 50.0).is_valid(612.0, 792.0));
        // inverted y
        assert!(!BBox::new(10.0, 50.0, 100.0, 10.0).is_valid(612.0, 792.0));
        // out of page
        assert!(!BBox::new(10.0, 10.0, 700.0, 50.0).is_valid(612.0, 792.0));
        assert!(!BBox::new(-1.0, 10.0, 100.0, 50.0).is_valid(612.0, 792.0));
    }

    #[test]
    fn bbox_union_is_enclosing() {
        let a = BBox::new(10.0, 10.0, 50.0, 40.0);
        let b = BBox::new(30.0, 5.0, 80.0, 30.0);
        let u = a.union(&b);
        assert_eq!(u, BBox::new(10.0, 5.0, 80.0, 40.0));
    }

    #[test]
    fn bbox_rounding() {
        let b = BBox::new(1.23456, 2.34567, 3.45678, 4.56789).rounded(2);
        assert_eq!(b, BBox::new(1.23, 2.35, 3.46, 4.57));
    }

    #[test]
    fn invalid_and_low_confidence_elements_dropped() {
        let layout = one_page_layout(vec![
            raw_element("paragraph", [10.0, 10.0, 100.0, 50.0], 0.9),
            raw_element("paragraph", [100.0, 10.0, 10.0, 50.0], 0.9), // inverted
            raw_element("paragraph", [10.0, 60.0, 100.0, 90.0], 0.1), // low confidence
            raw_element("hologram", [10.0, 100.0, 100.0, 130.0], 0.9), // unknown type
        ]);
        let mut chunks = Vec::new();
        let pages = build_page_structures(&layout, &mut chunks, 0.3, 2);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].elements.len(), 1);
        assert!(pages[0].has_structure);
        assert_eq!(pages[0].metadata_version, METADATA_VERSION_STRUCTURED);
    }

    #[test]
    fn chunk_element_mapping_single_and_spanning() {
        let doc_id = "b".repeat(64);
        let layout = one_page_layout(vec![
            raw_element("heading", [10.0, 700.0, 200.0, 730.0], 0.9),
            raw_element("paragraph", [10.0, 600.0, 300.0, 690.0], 0.9),
        ]);
        let mut chunks = vec![
            chunk_for(&doc_id, 0, vec![ids::element_id(1, 0)]),
            chunk_for(
                &doc_id,
                1,
                vec![ids::element_id(1, 0), ids::element_id(1, 1)],
            ),
        ];
        let pages = build_page_structures(&layout, &mut chunks, 0.3, 2);

        // Single-element chunk inherits that element's bbox.
        let b0 = chunk_bbox(&chunks[0], &pages).unwrap();
        assert_eq!(b0, BBox::new(10.0, 700.0, 200.0, 730.0));

        // Spanning chunk gets the enclosing rectangle.
        let b1 = chunk_bbox(&chunks[1], &pages).unwrap();
        assert_eq!(b1, BBox::new(10.0, 600.0, 300.0, 730.0));

        // Elements backlink to the chunks that reference them.
        let element0 = &pages[0].elements[0];
        assert!(element0.chunk_id.is_some());
    }

    #[test]
    fn chunk_with_dropped_element_loses_link() {
        let doc_id = "c".repeat(64);
        let layout = one_page_layout(vec![
            raw_element("paragraph", [100.0, 10.0, 10.0, 50.0], 0.9), // invalid, dropped
        ]);
        let mut chunks = vec![chunk_for(&doc_id, 0, vec![ids::element_id(1, 0)])];
        let pages = build_page_structures(&layout, &mut chunks, 0.3, 2);
        assert!(chunks[0].element_ids.is_empty());
        assert!(chunk_bbox(&chunks[0], &pages).is_none());
    }

    #[test]
    fn structure_compression_roundtrip() {
        let layout = one_page_layout(vec![raw_element(
            "table",
            [10.0, 10.0, 500.0, 300.0],
            0.8,
        )]);
        let mut chunks = Vec::new();
        let pages = build_page_structures(&layout, &mut chunks, 0.3, 2);
        let blob = compress_structure(&pages[0]).unwrap();
        let bytes = sidecar::decompress_from_b64(&blob).unwrap();
        let back: PageStructure = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.page, 1);
        assert_eq!(back.elements.len(), 1);
        assert_eq!(back.page_width, 612.0);
    }

    #[test]
    fn markdown_markers_wrap_located_chunks() {
        let doc_id = "d".repeat(64);
        let layout = one_page_layout(vec![raw_element(
            "paragraph",
            [10.0, 10.0, 100.0, 50.0],
            0.9,
        )]);
        let mut chunks = vec![chunk_for(&doc_id, 0, vec![ids::element_id(1, 0)])];
        chunks[0].text = "revenue grew".to_string();
        let pages = build_page_structures(&layout, &mut chunks, 0.3, 2);

        let markdown = "# Q4\n\nrevenue grew\n\ntail";
        let markers: Vec<ChunkMarker> = chunks
            .iter()
            .map(|c| ChunkMarker {
                chunk_id: c.chunk_id.clone(),
                page: c.page,
                bbox: chunk_bbox(c, &pages)
                    .map(|b| b.to_marker())
                    .unwrap_or_else(|| "0,0,0,0".to_string()),
                text: c.text.clone(),
            })
            .collect();
        let marked = annotate_markdown(markdown, &markers);
        assert!(marked.contains(&format!(
            "<!-- CHUNK_START: {}, PAGE: 1, BBOX: 10,10,100,50 -->revenue grew<!-- CHUNK_END: {} -->",
            chunks[0].chunk_id, chunks[0].chunk_id
        )));
        assert!(marked.starts_with("# Q4"));
        assert!(marked.ends_with("tail"));
    }

    #[test]
    fn markdown_markers_skip_unlocatable_chunks() {
        let doc_id = "e".repeat(64);
        let chunks = vec![TextChunk {
            text: "not in the markdown".to_string(),
            ..chunk_for(&doc_id, 0, vec![])
        }];
        let markdown = "entirely different body";
        let markers = vec![ChunkMarker {
            chunk_id: chunks[0].chunk_id.clone(),
            page: chunks[0].page,
            bbox: "0,0,0,0".to_string(),
            text: chunks[0].text.clone(),
        }];
        assert_eq!(annotate_markdown(markdown, &markers), markdown);
    }
}
