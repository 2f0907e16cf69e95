//! Document processor.
//!
//! Runs one document through the staged pipeline:
//!
//!   queued → parsing → embedding_visual → embedding_text → storing →
//!   emitting_structure → completed  (or failed from any stage)
//!
//! Progress is broadcast at every transition and at least every five seconds
//! inside long stages via a heartbeat.  The cancel token is observed at each
//! stage boundary and between encoder batches; encoder batches themselves run
//! to completion.  Dependency failures retry with 2/5/10 s backoff before the
//! job fails.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assets::AssetStore;
use crate::config::AppConfig;
use crate::encoder::EncoderClient;
use crate::error::{AppError, AppResult};
use crate::ids;
use crate::parser::{DocumentSource, FormatType, ParsedDoc, ParserClient, TextChunk};
use crate::sidecar;
use crate::state::{ServerEvent, now_iso};
use crate::structure::{
    self, METADATA_VERSION_LEGACY, METADATA_VERSION_STRUCTURED, PageStructure, StructureService,
};
use crate::vector_store::{Collection, VectorStoreClient};

const PREVIEW_CHARS: usize = 200;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_BACKOFF_S: [u64; 3] = [2, 5, 10];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Queued,
    Parsing,
    EmbeddingVisual,
    EmbeddingText,
    Storing,
    EmittingStructure,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Parsing => "parsing",
            Stage::EmbeddingVisual => "embedding_visual",
            Stage::EmbeddingText => "embedding_text",
            Stage::Storing => "storing",
            Stage::EmittingStructure => "emitting_structure",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Stage::Queued => "pending",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            _ => "processing",
        }
    }
}

/// Per-job context handed to the processor by the worker pool.
pub struct JobContext {
    pub job_id: String,
    pub doc_id: String,
    pub source: DocumentSource,
    pub cancel: CancellationToken,
    /// Observed by the worker's watchdog; updated once the page count is known.
    pub pages_tx: watch::Sender<usize>,
    /// Mirrors (stage, progress) into the job record.
    pub stage_tx: watch::Sender<(String, f32)>,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub doc_id: String,
    pub filename: String,
    pub chunks: usize,
    pub pages: Option<usize>,
    pub file_type: String,
    pub thumbnail_url: Option<String>,
}

/// Broadcasts staged progress and keeps a heartbeat alive inside long stages.
struct ProgressEmitter {
    events: broadcast::Sender<ServerEvent>,
    doc_id: String,
    filename: String,
    current_tx: watch::Sender<(Stage, f32)>,
    record_tx: watch::Sender<(String, f32)>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl ProgressEmitter {
    fn new(
        events: broadcast::Sender<ServerEvent>,
        doc_id: String,
        filename: String,
        record_tx: watch::Sender<(String, f32)>,
    ) -> Self {
        let (current_tx, current_rx) = watch::channel((Stage::Queued, 0.0f32));
        let hb_events = events.clone();
        let hb_doc = doc_id.clone();
        let hb_file = filename.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let (stage, progress) = *current_rx.borrow();
                if matches!(stage, Stage::Completed | Stage::Failed) {
                    break;
                }
                let _ = hb_events.send(ServerEvent::ProcessingUpdate {
                    doc_id: hb_doc.clone(),
                    filename: hb_file.clone(),
                    status: stage.status().to_string(),
                    stage: stage.as_str().to_string(),
                    progress,
                    message: None,
                    timestamp: now_iso(),
                });
            }
        });
        Self {
            events,
            doc_id,
            filename,
            current_tx,
            record_tx,
            heartbeat,
        }
    }

    fn set(&self, stage: Stage, progress: f32, message: Option<String>) {
        let _ = self.current_tx.send((stage, progress));
        let _ = self.record_tx.send((stage.as_str().to_string(), progress));
        let _ = self.events.send(ServerEvent::ProcessingUpdate {
            doc_id: self.doc_id.clone(),
            filename: self.filename.clone(),
            status: stage.status().to_string(),
            stage: stage.as_str().to_string(),
            progress,
            message,
            timestamp: now_iso(),
        });
    }
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

pub struct Processor {
    parser: Arc<ParserClient>,
    encoder: Arc<EncoderClient>,
    store: Arc<VectorStoreClient>,
    assets: Arc<AssetStore>,
    structure: Arc<StructureService>,
    events: broadcast::Sender<ServerEvent>,
    markdown_threshold: usize,
    structure_min_confidence: f64,
    bbox_precision: u32,
    structure_compression: bool,
}

impl Processor {
    pub fn new(
        parser: Arc<ParserClient>,
        encoder: Arc<EncoderClient>,
        store: Arc<VectorStoreClient>,
        assets: Arc<AssetStore>,
        structure: Arc<StructureService>,
        events: broadcast::Sender<ServerEvent>,
        config: &AppConfig,
    ) -> Self {
        Self {
            parser,
            encoder,
            store,
            assets,
            structure,
            events,
            markdown_threshold: config.markdown_compression_threshold_bytes,
            structure_min_confidence: config.structure_min_confidence,
            bbox_precision: config.bbox_coordinate_precision,
            structure_compression: config.structure_compression,
        }
    }

    pub async fn process(&self, ctx: &JobContext) -> AppResult<ProcessOutcome> {
        let progress = ProgressEmitter::new(
            self.events.clone(),
            ctx.doc_id.clone(),
            ctx.source.filename.clone(),
            ctx.stage_tx.clone(),
        );
        match self.run_stages(ctx, &progress).await {
            Ok(outcome) => {
                progress.set(Stage::Completed, 1.0, None);
                let _ = self.events.send(ServerEvent::ProcessingComplete {
                    doc_id: outcome.doc_id.clone(),
                    filename: outcome.filename.clone(),
                    chunks: outcome.chunks,
                    pages: outcome.pages,
                    file_type: outcome.file_type.clone(),
                    thumbnail_url: outcome.thumbnail_url.clone(),
                    timestamp: now_iso(),
                });
                Ok(outcome)
            }
            Err(e) => {
                let stage = *progress.current_tx.borrow();
                if !matches!(e, AppError::Cancelled) {
                    progress.set(Stage::Failed, stage.1, Some(e.to_string()));
                    let _ = self.events.send(ServerEvent::ProcessingError {
                        doc_id: ctx.doc_id.clone(),
                        filename: ctx.source.filename.clone(),
                        stage: stage.0.as_str().to_string(),
                        error: e.to_string(),
                        timestamp: now_iso(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        ctx: &JobContext,
        progress: &ProgressEmitter,
    ) -> AppResult<ProcessOutcome> {
        let doc_id = &ctx.doc_id;
        let source = &ctx.source;
        let cancel = &ctx.cancel;

        // --- parsing ------------------------------------------------------
        ensure_active(cancel)?;
        progress.set(Stage::Parsing, 0.05, None);
        let mut parsed = with_retry(cancel, || self.parser.parse_document(doc_id, source)).await?;
        let num_pages = parsed.pages.len();
        let _ = ctx.pages_tx.send(num_pages.max(1));
        info!(
            job_id = %ctx.job_id,
            doc_id,
            pages = num_pages,
            chunks = parsed.chunks.len(),
            format = %parsed.format,
            "parse complete"
        );

        // Page images go to disk before any storage call; the search UI
        // depends on asset availability the moment results show up.
        ensure_active(cancel)?;
        if parsed.format_type == FormatType::Visual {
            for page in &parsed.pages {
                if let Some(png) = &page.image_png {
                    self.assets
                        .save_page_image(doc_id, page.page_number, png)?;
                }
            }
            progress.set(Stage::Parsing, 0.2, Some("page images written".into()));
        }

        if let Some((art, mime)) = &parsed.album_art {
            // Album art is best-effort.
            if let Err(e) = self.assets.save_album_art(doc_id, art, mime) {
                warn!(doc_id, error = %e, "album art save failed");
            }
        }

        // Structure is best-effort: a failure downgrades the document to the
        // legacy metadata version instead of failing the job.
        let page_structures: Vec<PageStructure> = match parsed.layout.take() {
            Some(layout) => structure::build_page_structures(
                &layout,
                &mut parsed.chunks,
                self.structure_min_confidence,
                self.bbox_precision,
            ),
            None => Vec::new(),
        };
        let has_structure = page_structures.iter().any(|p| !p.elements.is_empty());

        // --- embedding_visual --------------------------------------------
        ensure_active(cancel)?;
        let visual_embeddings = if parsed.format_type == FormatType::Visual {
            progress.set(Stage::EmbeddingVisual, 0.3, None);
            let images: Vec<Vec<u8>> = parsed
                .pages
                .iter()
                .filter_map(|p| p.image_png.clone())
                .collect();
            with_retry(cancel, || self.encoder.embed_pages(&images, cancel)).await?
        } else {
            Vec::new()
        };

        // --- embedding_text ----------------------------------------------
        ensure_active(cancel)?;
        progress.set(Stage::EmbeddingText, 0.55, None);
        let chunk_texts: Vec<&str> = parsed.chunks.iter().map(|c| c.text.as_str()).collect();
        let text_embeddings = if chunk_texts.is_empty() {
            Vec::new()
        } else {
            with_retry(cancel, || self.encoder.embed_chunks(&chunk_texts, cancel)).await?
        };

        // --- storing ------------------------------------------------------
        ensure_active(cancel)?;
        progress.set(Stage::Storing, 0.75, None);
        let markdown_fields = self.markdown_fields(doc_id, &parsed);
        let base = self.base_metadata(doc_id, source, &parsed, num_pages, has_structure, &markdown_fields);

        let pages_with_images: Vec<&crate::parser::Page> = parsed
            .pages
            .iter()
            .filter(|p| p.image_png.is_some())
            .collect();
        for (page, multivec) in pages_with_images.iter().zip(&visual_embeddings) {
            ensure_active(cancel)?;
            let mut metadata = base.clone();
            let obj = metadata.as_object_mut().unwrap();
            obj.insert("page".into(), json!(page.page_number));
            obj.insert("preview".into(), json!(truncate_preview(&page.text)));
            if self.structure_compression {
                if let Some(ps) = page_structures.iter().find(|s| s.page == page.page_number) {
                    if !ps.elements.is_empty() {
                        match structure::compress_structure(ps) {
                            Ok(blob) => {
                                obj.insert(sidecar::STRUCTURE_COMPRESSED_KEY.into(), json!(blob));
                            }
                            Err(e) => warn!(doc_id, page = page.page_number, error = %e, "structure blob encode failed"),
                        }
                    }
                }
            }
            let embedding_id = ids::visual_embedding_id(doc_id, page.page_number);
            with_retry(cancel, || {
                self.store
                    .add(Collection::Visual, &embedding_id, multivec, &metadata)
            })
            .await?;
        }

        for (chunk, multivec) in parsed.chunks.iter().zip(&text_embeddings) {
            ensure_active(cancel)?;
            let metadata = self.chunk_metadata(&base, chunk, &page_structures, has_structure);
            let embedding_id = ids::text_embedding_id(&chunk.chunk_id);
            with_retry(cancel, || {
                self.store
                    .add(Collection::Text, &embedding_id, multivec, &metadata)
            })
            .await?;
        }

        // A document with no embeddings at all (e.g. an empty markdown file)
        // still needs a durable record so metadata lookups resolve.
        if visual_embeddings.is_empty() && text_embeddings.is_empty() {
            let mut metadata = base.clone();
            metadata
                .as_object_mut()
                .unwrap()
                .insert("placeholder".into(), json!(true));
            let placeholder = crate::encoder::MultiVector { dim: 1, data: vec![0.0] };
            let embedding_id = ids::text_embedding_id(&ids::chunk_id(doc_id, 0));
            with_retry(cancel, || {
                self.store
                    .add(Collection::Text, &embedding_id, &placeholder, &metadata)
            })
            .await?;
        }

        // --- emitting_structure ------------------------------------------
        ensure_active(cancel)?;
        progress.set(Stage::EmittingStructure, 0.9, None);
        for ps in page_structures {
            if !ps.elements.is_empty() {
                self.structure.insert(doc_id, ps);
            }
        }

        Ok(ProcessOutcome {
            doc_id: doc_id.clone(),
            filename: source.filename.clone(),
            chunks: parsed.chunks.len(),
            pages: (parsed.format_type == FormatType::Visual).then_some(num_pages),
            file_type: parsed.format_type.as_str().to_string(),
            thumbnail_url: self.assets.thumbnail_url(doc_id),
        })
    }

    /// Markdown sidecar fields, attached to every embedding of the document
    /// so retrieval can recover the markdown from either collection.
    fn markdown_fields(&self, doc_id: &str, parsed: &ParsedDoc) -> Value {
        let mut fields = serde_json::Map::new();
        match &parsed.markdown {
            Some(markdown) => match sidecar::encode_markdown(markdown, self.markdown_threshold) {
                Ok(payload) => {
                    fields.insert("markdown_extracted".into(), json!(true));
                    fields.insert("markdown_length".into(), json!(markdown.len()));
                    fields.insert(
                        sidecar::MARKDOWN_COMPRESSION_KEY.into(),
                        json!(payload.compression()),
                    );
                    fields.insert(payload.metadata_key().into(), json!(payload.value()));
                }
                Err(e) => {
                    // Oversize markdown is recorded, not fatal.
                    warn!(doc_id, error = %e, "markdown sidecar rejected");
                    fields.insert("markdown_extracted".into(), json!(false));
                    fields.insert("markdown_error".into(), json!(e.to_string()));
                }
            },
            None => {
                fields.insert("markdown_extracted".into(), json!(false));
                if let Some(err) = &parsed.markdown_error {
                    fields.insert("markdown_error".into(), json!(err));
                }
            }
        }
        Value::Object(fields)
    }

    fn base_metadata(
        &self,
        doc_id: &str,
        source: &DocumentSource,
        parsed: &ParsedDoc,
        num_pages: usize,
        has_structure: bool,
        markdown_fields: &Value,
    ) -> Value {
        let mut metadata = json!({
            "doc_id": doc_id,
            "filename": source.filename,
            "source_key": source.key,
            "format": parsed.format,
            "format_type": parsed.format_type.as_str(),
            "upload_ts": chrono::Utc::now().timestamp(),
            "status": "completed",
            "num_pages": num_pages,
            "has_structure": has_structure,
            "metadata_version": if has_structure {
                METADATA_VERSION_STRUCTURED
            } else {
                METADATA_VERSION_LEGACY
            },
        });
        let obj = metadata.as_object_mut().unwrap();

        if let Value::Object(fields) = markdown_fields {
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }

        if let Some(audio) = &parsed.audio {
            let audio_json = serde_json::to_value(audio).unwrap_or(Value::Null);
            if let Value::Object(fields) = audio_json {
                for (k, v) in fields {
                    if !v.is_null() {
                        obj.insert(format!("audio_{}", k), v);
                    }
                }
            }
            if parsed.album_art.is_some() {
                obj.insert("audio_album_art".into(), json!(true));
            }
        }

        metadata
    }

    fn chunk_metadata(
        &self,
        base: &Value,
        chunk: &TextChunk,
        page_structures: &[PageStructure],
        has_structure: bool,
    ) -> Value {
        let mut metadata = base.clone();
        let obj = metadata.as_object_mut().unwrap();
        obj.insert("page".into(), json!(chunk.page));
        obj.insert("chunk_id".into(), json!(chunk.chunk_id));
        obj.insert("chunk_index".into(), json!(chunk.index));
        obj.insert("text".into(), json!(chunk.text));
        obj.insert("preview".into(), json!(truncate_preview(&chunk.text)));
        if let Some(prev) = &chunk.prev_chunk_id {
            obj.insert("prev_chunk_id".into(), json!(prev));
        }
        if let Some(next) = &chunk.next_chunk_id {
            obj.insert("next_chunk_id".into(), json!(next));
        }
        if let Some(heading) = &chunk.section_heading {
            obj.insert("section_heading".into(), json!(heading));
        }
        if has_structure {
            if let Some(element_id) = chunk.element_ids.first() {
                obj.insert("element_id".into(), json!(element_id));
            }
            if let Some(element_type) = &chunk.element_type {
                obj.insert("element_type".into(), json!(element_type));
            }
            if let Some(bbox) = structure::chunk_bbox(chunk, page_structures) {
                obj.insert("bbox_left".into(), json!(bbox.left));
                obj.insert("bbox_bottom".into(), json!(bbox.bottom));
                obj.insert("bbox_right".into(), json!(bbox.right));
                obj.insert("bbox_top".into(), json!(bbox.top));
            }
        }
        metadata
    }
}

fn ensure_active(cancel: &CancellationToken) -> AppResult<()> {
    if cancel.is_cancelled() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

fn truncate_preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        trimmed.to_string()
    } else {
        trimmed.chars().take(PREVIEW_CHARS).collect()
    }
}

/// Retry retryable failures with 2/5/10 s backoff, respecting cancellation
/// during the wait.
async fn with_retry<T, Fut>(
    cancel: &CancellationToken,
    mut operation: impl FnMut() -> Fut,
) -> AppResult<T>
where
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt = 0usize;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < RETRY_BACKOFF_S.len() => {
                warn!(attempt, error = %e, "retryable stage failure, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(RETRY_BACKOFF_S[attempt])) => {}
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_and_statuses() {
        assert_eq!(Stage::Queued.as_str(), "queued");
        assert_eq!(Stage::EmbeddingVisual.as_str(), "embedding_visual");
        assert_eq!(Stage::EmittingStructure.as_str(), "emitting_structure");
        assert_eq!(Stage::Queued.status(), "pending");
        assert_eq!(Stage::Storing.status(), "processing");
        assert_eq!(Stage::Completed.status(), "completed");
        assert_eq!(Stage::Failed.status(), "failed");
    }

    #[test]
    fn preview_truncation() {
        assert_eq!(truncate_preview("  short  "), "short");
        let long = "a".repeat(500);
        assert_eq!(truncate_preview(&long).chars().count(), PREVIEW_CHARS);
    }

    #[tokio::test]
    async fn retry_gives_up_on_fatal_errors() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: AppResult<()> = with_retry(&cancel, || {
            calls += 1;
            async { Err(AppError::Encoder("oom".into())) }
        })
        .await;
        assert!(matches!(result, Err(AppError::Encoder(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: AppResult<()> = with_retry(&cancel, || async {
            Err(AppError::Dependency("down".into()))
        })
        .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_then_succeeds() {
        let cancel = CancellationToken::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_ref = calls.clone();
        let result = with_retry(&cancel, move || {
            let calls = calls_ref.clone();
            async move {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < 2 {
                    Err(AppError::Dependency("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
