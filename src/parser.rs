//! Format router and parser adapter.
//!
//! Classifies an upload by extension, drives the external parsing service
//! (and the legacy-office converter when needed) and normalises the result
//! into a `ParsedDoc` the processor can work with.  The parser service pulls
//! the object from the store itself; we hand it `(bucket, key)` plus the
//! options it needs.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::ids;

/// Pipeline family for a document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    Visual,
    Text,
    Audio,
}

impl FormatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatType::Visual => "visual",
            FormatType::Text => "text",
            FormatType::Audio => "audio",
        }
    }
}

/// Routing class, one step earlier than [`FormatType`]: legacy office files
/// are converted to `.docx` and re-enter the router as text documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Visual,
    TextOnly,
    Audio,
    LegacyOffice,
}

impl RouteClass {
    pub fn format_type(&self) -> FormatType {
        match self {
            RouteClass::Visual => FormatType::Visual,
            RouteClass::TextOnly | RouteClass::LegacyOffice => FormatType::Text,
            RouteClass::Audio => FormatType::Audio,
        }
    }
}

/// Extension → pipeline.  Unknown extensions are unsupported.
pub fn classify_extension(ext: &str) -> Option<RouteClass> {
    let ext = ext.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" | "png" | "jpg" | "jpeg" | "tiff" | "bmp" | "webp" => Some(RouteClass::Visual),
        "docx" | "xlsx" | "pptx" | "md" | "html" | "htm" | "xhtml" | "asciidoc" | "csv"
        | "xml" | "json" | "vtt" => Some(RouteClass::TextOnly),
        "mp3" | "wav" => Some(RouteClass::Audio),
        "doc" | "dot" => Some(RouteClass::LegacyOffice),
        _ => None,
    }
}

pub fn classify_filename(filename: &str) -> Option<RouteClass> {
    let ext = filename.rsplit('.').next().filter(|e| *e != filename)?;
    classify_extension(ext)
}

/// One parsed page: optional rasterisation plus extracted text.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_number: usize,
    pub image_png: Option<Vec<u8>>,
    pub text: String,
}

/// The unit of text embedding and citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub page: usize,
    pub index: usize,
    pub text: String,
    pub element_ids: Vec<String>,
    pub element_type: Option<String>,
    pub section_heading: Option<String>,
    pub prev_chunk_id: Option<String>,
    pub next_chunk_id: Option<String>,
}

/// ID3 tags plus container properties, extracted before ASR runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioMetadata {
    pub duration_s: Option<f64>,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate_hz: Option<u32>,
    pub channels: Option<u32>,
    pub encoder: Option<String>,
    pub format: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub track_number: Option<String>,
    pub composer: Option<String>,
    pub comment: Option<String>,
    pub publisher: Option<String>,
}

/// Raw layout element as the parser reports it; validated and typed by the
/// structure service.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLayoutElement {
    pub element_type: String,
    /// `[left, bottom, right, top]` in PDF points.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPageLayout {
    pub page: usize,
    pub width: f64,
    pub height: f64,
    pub elements: Vec<RawLayoutElement>,
}

/// Normalised output of the parse stage.
#[derive(Debug)]
pub struct ParsedDoc {
    pub format_type: FormatType,
    pub format: String,
    pub pages: Vec<Page>,
    pub chunks: Vec<TextChunk>,
    pub markdown: Option<String>,
    pub markdown_error: Option<String>,
    pub layout: Option<Vec<RawPageLayout>>,
    pub audio: Option<AudioMetadata>,
    pub album_art: Option<(Vec<u8>, String)>,
}

#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub bucket: String,
    pub key: String,
    pub filename: String,
    pub size: u64,
    /// Content-derived tag from the upload event (the object's eTag).
    pub content_tag: Option<String>,
}

impl DocumentSource {
    /// Canonical document id: a pure function of the upload's name and its
    /// content tag.  Events that somehow lack an eTag fall back to the
    /// object size as the content component.
    pub fn doc_id(&self) -> String {
        match &self.content_tag {
            Some(tag) => ids::derive_doc_id(&self.filename, ids::normalize_etag(tag)),
            None => ids::derive_doc_id(&self.filename, &format!("size:{}", self.size)),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types for the parser service
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ParseResponseWire {
    #[serde(default)]
    pages: Vec<PageWire>,
    #[serde(default)]
    chunks: Vec<ChunkWire>,
    #[serde(default)]
    markdown: Option<String>,
    #[serde(default)]
    markdown_error: Option<String>,
    #[serde(default)]
    layout: Option<Vec<RawPageLayout>>,
}

#[derive(Debug, Deserialize)]
struct PageWire {
    page_number: usize,
    #[serde(default)]
    image_png_b64: Option<String>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChunkWire {
    page: usize,
    text: String,
    #[serde(default)]
    element_ids: Vec<String>,
    #[serde(default)]
    element_type: Option<String>,
    #[serde(default)]
    section_heading: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioMetadataWire {
    #[serde(flatten)]
    metadata: AudioMetadata,
    #[serde(default)]
    album_art_b64: Option<String>,
    #[serde(default)]
    album_art_mime: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponseWire {
    #[serde(default)]
    segments: Vec<TranscriptSegmentWire>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptSegmentWire {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ConvertResponseWire {
    output_path: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ParserClient {
    http: reqwest::Client,
    parser_url: String,
    converter_url: String,
    converter_timeout: Duration,
    structure_timeout_s: u64,
    asr: crate::config::AsrConfig,
}

impl ParserClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.parser_timeout_s))
            .build()
            .map_err(|e| AppError::Dependency(format!("failed to build parser client: {}", e)))?;
        Ok(Self {
            http,
            parser_url: config.parser_url.trim_end_matches('/').to_string(),
            converter_url: config.converter_url.trim_end_matches('/').to_string(),
            converter_timeout: Duration::from_secs(config.doc_conversion_timeout_s),
            structure_timeout_s: config.structure_extraction_timeout_s,
            asr: config.asr.clone(),
        })
    }

    /// Parse a document end to end, following the router rules.
    pub async fn parse_document(
        &self,
        doc_id: &str,
        source: &DocumentSource,
    ) -> AppResult<ParsedDoc> {
        let route = classify_filename(&source.filename).ok_or_else(|| {
            AppError::InvalidInput(format!("unsupported format: {}", source.filename))
        })?;

        match route {
            RouteClass::LegacyOffice => {
                // Convert to .docx, then re-enter the router with the new key
                // while keeping the original filename and doc_id.
                let converted_key = self.convert_legacy(&source.key).await?;
                info!(doc_id, from = %source.key, to = %converted_key, "legacy office converted");
                let converted = DocumentSource {
                    bucket: source.bucket.clone(),
                    key: converted_key,
                    filename: source.filename.clone(),
                    size: source.size,
                    content_tag: source.content_tag.clone(),
                };
                let mut parsed = self
                    .parse_with_service(doc_id, &converted, RouteClass::TextOnly)
                    .await?;
                // The document keeps its legacy format label even though
                // storage now holds a .docx.
                parsed.format = extension_of(&source.filename);
                Ok(parsed)
            }
            RouteClass::Audio => self.parse_audio(doc_id, source).await,
            other => self.parse_with_service(doc_id, source, other).await,
        }
    }

    async fn parse_with_service(
        &self,
        doc_id: &str,
        source: &DocumentSource,
        route: RouteClass,
    ) -> AppResult<ParsedDoc> {
        let body = json!({
            "bucket": source.bucket,
            "key": source.key,
            "filename": source.filename,
            "render_pages": route == RouteClass::Visual,
            "structure_timeout_s": self.structure_timeout_s,
        });
        let resp = self
            .http
            .post(format!("{}/parse", self.parser_url))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "parser returned {}: {}",
                status, text
            )));
        }
        let wire: ParseResponseWire = resp
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad parser response: {}", e)))?;

        let mut pages = Vec::with_capacity(wire.pages.len());
        for page in wire.pages {
            let image_png = match page.image_png_b64 {
                Some(b64) => Some(B64.decode(&b64).map_err(|e| {
                    AppError::Corrupted(format!("page {} image is not valid base64: {}", page.page_number, e))
                })?),
                None => None,
            };
            pages.push(Page {
                page_number: page.page_number,
                image_png,
                text: page.text,
            });
        }
        pages.sort_by_key(|p| p.page_number);

        if wire.markdown.is_none() {
            // Markdown export failure is non-fatal; the page list stands.
            if let Some(err) = &wire.markdown_error {
                warn!(doc_id, error = %err, "markdown extraction failed");
            }
        }

        let chunks = link_chunks(doc_id, wire.chunks);

        Ok(ParsedDoc {
            format_type: route.format_type(),
            format: extension_of(&source.filename),
            pages,
            chunks,
            markdown: wire.markdown,
            markdown_error: wire.markdown_error,
            layout: wire.layout,
            audio: None,
            album_art: None,
        })
    }

    /// Audio: ID3 and container properties are read before ASR, so tag
    /// metadata survives even when transcription fails.
    async fn parse_audio(&self, doc_id: &str, source: &DocumentSource) -> AppResult<ParsedDoc> {
        let metadata_body = json!({ "bucket": source.bucket, "key": source.key });
        let resp = self
            .http
            .post(format!("{}/audio/metadata", self.parser_url))
            .json(&metadata_body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "parser returned {}: {}",
                status, text
            )));
        }
        let wire: AudioMetadataWire = resp
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad audio metadata response: {}", e)))?;

        let album_art = match (wire.album_art_b64, wire.album_art_mime) {
            (Some(b64), Some(mime)) => match B64.decode(&b64) {
                Ok(bytes) => Some((bytes, mime)),
                Err(e) => {
                    warn!(doc_id, error = %e, "album art payload undecodable, dropping");
                    None
                }
            },
            _ => None,
        };

        let transcript = if self.asr.enabled {
            self.transcribe(source).await?
        } else {
            String::new()
        };

        let chunks = link_chunks(
            doc_id,
            segment_transcript(&transcript)
                .into_iter()
                .map(|text| ChunkWire {
                    page: 1,
                    text,
                    element_ids: Vec::new(),
                    element_type: None,
                    section_heading: None,
                })
                .collect(),
        );

        Ok(ParsedDoc {
            format_type: FormatType::Audio,
            format: extension_of(&source.filename),
            pages: Vec::new(),
            chunks,
            markdown: (!transcript.is_empty()).then(|| transcript.clone()),
            markdown_error: None,
            layout: None,
            audio: Some(wire.metadata),
            album_art,
        })
    }

    async fn transcribe(&self, source: &DocumentSource) -> AppResult<String> {
        let body = json!({
            "bucket": source.bucket,
            "key": source.key,
            "model": self.asr.model,
            "language": self.asr.language,
            "device": self.asr.device.as_str(),
            "word_timestamps": self.asr.word_timestamps,
            "temperature": self.asr.temperature,
            "max_time_chunk": self.asr.max_time_chunk_s,
        });
        let resp = self
            .http
            .post(format!("{}/audio/transcribe", self.parser_url))
            .json(&body)
            // ASR runs long; scale the timeout with the chunk window.
            .timeout(Duration::from_secs(300))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "ASR returned {}: {}",
                status, text
            )));
        }
        let wire: TranscribeResponseWire = resp
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad transcribe response: {}", e)))?;

        if !wire.segments.is_empty() {
            Ok(wire
                .segments
                .into_iter()
                .map(|s| s.text)
                .collect::<Vec<_>>()
                .join(" "))
        } else {
            Ok(wire.text)
        }
    }

    async fn convert_legacy(&self, key: &str) -> AppResult<String> {
        let body = json!({
            "file_path": key,
            "output_dir": "converted",
        });
        let resp = self
            .http
            .post(format!("{}/convert", self.converter_url))
            .json(&body)
            .timeout(self.converter_timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "converter returned {}: {}",
                status, text
            )));
        }
        let wire: ConvertResponseWire = resp
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad converter response: {}", e)))?;
        Ok(wire.output_path)
    }
}

/// Assign chunk ids and prev/next links in document order.
fn link_chunks(doc_id: &str, wire: Vec<ChunkWire>) -> Vec<TextChunk> {
    let total = wire.len();
    wire.into_iter()
        .enumerate()
        .map(|(index, c)| TextChunk {
            chunk_id: ids::chunk_id(doc_id, index),
            doc_id: doc_id.to_string(),
            page: c.page,
            index,
            text: c.text,
            element_ids: c.element_ids,
            element_type: c.element_type,
            section_heading: c.section_heading,
            prev_chunk_id: (index > 0).then(|| ids::chunk_id(doc_id, index - 1)),
            next_chunk_id: (index + 1 < total).then(|| ids::chunk_id(doc_id, index + 1)),
        })
        .collect()
}

/// Split a transcript into embedding-sized chunks on sentence-ish boundaries.
fn segment_transcript(transcript: &str) -> Vec<String> {
    const MAX_CHUNK_CHARS: usize = 800;
    let trimmed = transcript.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in trimmed.split_inclusive(['.', '!', '?']) {
        if !current.is_empty() && current.len() + sentence.len() > MAX_CHUNK_CHARS {
            chunks.push(current.trim().to_string());
            current = String::new();
        }
        current.push_str(sentence);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

fn extension_of(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .filter(|e| *e != filename)
        .unwrap_or("")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_classification() {
        assert_eq!(classify_extension("pdf"), Some(RouteClass::Visual));
        assert_eq!(classify_extension("PNG"), Some(RouteClass::Visual));
        assert_eq!(classify_extension("webp"), Some(RouteClass::Visual));
        assert_eq!(classify_extension("docx"), Some(RouteClass::TextOnly));
        assert_eq!(classify_extension("vtt"), Some(RouteClass::TextOnly));
        assert_eq!(classify_extension("mp3"), Some(RouteClass::Audio));
        assert_eq!(classify_extension("wav"), Some(RouteClass::Audio));
        assert_eq!(classify_extension("doc"), Some(RouteClass::LegacyOffice));
        assert_eq!(classify_extension("dot"), Some(RouteClass::LegacyOffice));
        assert_eq!(classify_extension("exe"), None);
    }

    #[test]
    fn filename_classification() {
        assert_eq!(classify_filename("q4.pdf"), Some(RouteClass::Visual));
        assert_eq!(classify_filename("notes.MD"), Some(RouteClass::TextOnly));
        assert_eq!(classify_filename("no_extension"), None);
    }

    #[test]
    fn route_class_format_types() {
        assert_eq!(RouteClass::Visual.format_type(), FormatType::Visual);
        assert_eq!(RouteClass::TextOnly.format_type(), FormatType::Text);
        assert_eq!(RouteClass::LegacyOffice.format_type(), FormatType::Text);
        assert_eq!(RouteClass::Audio.format_type(), FormatType::Audio);
    }

    #[test]
    fn chunk_linking() {
        let doc_id = "f".repeat(64);
        let wire = vec![
            ChunkWire {
                page: 1,
                text: "first".into(),
                element_ids: vec![],
                element_type: None,
                section_heading: None,
            },
            ChunkWire {
                page: 1,
                text: "second".into(),
                element_ids: vec![],
                element_type: None,
                section_heading: None,
            },
            ChunkWire {
                page: 2,
                text: "third".into(),
                element_ids: vec![],
                element_type: None,
                section_heading: None,
            },
        ];
        let chunks = link_chunks(&doc_id, wire);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chunk_id, ids::chunk_id(&doc_id, 0));
        assert_eq!(chunks[0].prev_chunk_id, None);
        assert_eq!(chunks[0].next_chunk_id, Some(ids::chunk_id(&doc_id, 1)));
        assert_eq!(chunks[1].prev_chunk_id, Some(ids::chunk_id(&doc_id, 0)));
        assert_eq!(chunks[2].next_chunk_id, None);
        assert_eq!(chunks[2].page, 2);
    }

    #[test]
    fn transcript_segmentation() {
        assert!(segment_transcript("").is_empty());
        assert!(segment_transcript("   ").is_empty());

        let short = segment_transcript("One sentence.");
        assert_eq!(short, vec!["One sentence."]);

        let long_text = "A sentence that repeats. ".repeat(100);
        let chunks = segment_transcript(&long_text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 850));
    }

    #[test]
    fn extension_extraction() {
        assert_eq!(extension_of("report.DOC"), "doc");
        assert_eq!(extension_of("a.b.pdf"), "pdf");
        assert_eq!(extension_of("noext"), "");
    }
}
