//! Delete coordinator.
//!
//! Removes every artefact of a document in a fixed order, reporting
//! per-stage status even on partial failure.  Vector-store removal is the
//! critical first stage: if it fails, nothing else is attempted and the
//! report marks the remaining stages as skipped, so an operator can re-run
//! the deletion safely.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::assets::AssetStore;
use crate::error::{AppError, AppResult};
use crate::ids;
use crate::object_store::ObjectStoreClient;
use crate::structure::StructureService;
use crate::vector_store::VectorStoreClient;

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageStatus {
    fn deleted() -> Self {
        Self { status: "deleted".to_string(), error: None }
    }

    fn skipped() -> Self {
        Self { status: "skipped".to_string(), error: None }
    }

    fn failed(e: &AppError) -> Self {
        Self {
            status: "failed".to_string(),
            error: Some(e.to_string()),
        }
    }

    fn is_deleted(&self) -> bool {
        self.status == "deleted"
    }
}

#[derive(Debug, Serialize)]
pub struct VectorStage {
    pub visual_embeddings: usize,
    pub text_embeddings: usize,
    #[serde(flatten)]
    pub status: StageStatus,
}

#[derive(Debug, Serialize)]
pub struct PageImageStage {
    pub pages: usize,
    #[serde(flatten)]
    pub status: StageStatus,
}

#[derive(Debug, Serialize)]
pub struct AlbumArtStage {
    pub existed: bool,
    #[serde(flatten)]
    pub status: StageStatus,
}

#[derive(Debug, Serialize)]
pub struct StructureCacheStage {
    pub entries: usize,
    #[serde(flatten)]
    pub status: StageStatus,
}

#[derive(Debug, Serialize)]
pub struct DeletionReport {
    pub doc_id: String,
    pub chromadb: VectorStage,
    pub page_images: PageImageStage,
    pub album_art: AlbumArtStage,
    pub structure_cache: StructureCacheStage,
    pub markdown: StageStatus,
    pub source_object: StageStatus,
    pub overall: String,
}

pub struct DeleteCoordinator {
    store: Arc<VectorStoreClient>,
    assets: Arc<AssetStore>,
    structure: Arc<StructureService>,
    object_store: Arc<ObjectStoreClient>,
}

impl DeleteCoordinator {
    pub fn new(
        store: Arc<VectorStoreClient>,
        assets: Arc<AssetStore>,
        structure: Arc<StructureService>,
        object_store: Arc<ObjectStoreClient>,
    ) -> Self {
        Self { store, assets, structure, object_store }
    }

    pub async fn delete_document(&self, doc_id: &str) -> AppResult<DeletionReport> {
        if !ids::is_valid_doc_id(doc_id) {
            return Err(AppError::InvalidInput(format!("malformed doc_id '{}'", doc_id)));
        }

        // The source key must be read before the embeddings (and the
        // metadata they carry) disappear.
        let metadata = self.store.get_document_metadata(doc_id).await?;
        if metadata.is_none() {
            return Err(AppError::NotFound(format!("document {}", doc_id)));
        }
        let source_key = metadata
            .as_ref()
            .and_then(|m| m.get("source_key"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        // Stage 1: vector collections (critical).
        let chromadb = match self.store.delete_by_doc(doc_id).await {
            Ok((visual, text)) => VectorStage {
                visual_embeddings: visual,
                text_embeddings: text,
                status: StageStatus::deleted(),
            },
            Err(e) => {
                warn!(doc_id, error = %e, "vector deletion failed, aborting");
                return Ok(DeletionReport {
                    doc_id: doc_id.to_string(),
                    chromadb: VectorStage {
                        visual_embeddings: 0,
                        text_embeddings: 0,
                        status: StageStatus::failed(&e),
                    },
                    page_images: PageImageStage { pages: 0, status: StageStatus::skipped() },
                    album_art: AlbumArtStage { existed: false, status: StageStatus::skipped() },
                    structure_cache: StructureCacheStage { entries: 0, status: StageStatus::skipped() },
                    markdown: StageStatus::skipped(),
                    source_object: StageStatus::skipped(),
                    overall: "partial".to_string(),
                });
            }
        };

        // Stage 2: page images and thumbnails.
        let page_images = match self.assets.delete_pages(doc_id) {
            Ok(pages) => PageImageStage { pages, status: StageStatus::deleted() },
            Err(e) => PageImageStage { pages: 0, status: StageStatus::failed(&e) },
        };

        // Stage 3: album art.
        let album_art = match self.assets.delete_album_art(doc_id) {
            Ok(existed) => AlbumArtStage { existed, status: StageStatus::deleted() },
            Err(e) => AlbumArtStage { existed: false, status: StageStatus::failed(&e) },
        };

        // Stage 4: structure cache entries.
        let entries = self.structure.evict_doc(doc_id);
        let structure_cache = StructureCacheStage { entries, status: StageStatus::deleted() };

        // Stage 5: inline markdown went with the embeddings in stage 1.
        let markdown = StageStatus::deleted();

        // Stage 6: the source object.
        let source_object = match source_key {
            Some(key) => match self.object_store.delete_object(&key).await {
                Ok(()) => StageStatus::deleted(),
                Err(e) => StageStatus::failed(&e),
            },
            None => StageStatus::skipped(),
        };

        let all_ok = chromadb.status.is_deleted()
            && page_images.status.is_deleted()
            && album_art.status.is_deleted()
            && structure_cache.status.is_deleted()
            && (source_object.is_deleted() || source_object.status == "skipped");
        let overall = if all_ok { "deleted" } else { "partial" };

        info!(doc_id, overall, "document deletion finished");

        Ok(DeletionReport {
            doc_id: doc_id.to_string(),
            chromadb,
            page_images,
            album_art,
            structure_cache,
            markdown,
            source_object,
            overall: overall.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_constructors() {
        assert!(StageStatus::deleted().is_deleted());
        assert!(!StageStatus::skipped().is_deleted());
        let failed = StageStatus::failed(&AppError::Dependency("down".into()));
        assert_eq!(failed.status, "failed");
        assert!(failed.error.is_some());
    }

    #[test]
    fn report_serialises_with_flattened_status() {
        let report = DeletionReport {
            doc_id: "a".repeat(64),
            chromadb: VectorStage {
                visual_embeddings: 3,
                text_embeddings: 12,
                status: StageStatus::deleted(),
            },
            page_images: PageImageStage { pages: 3, status: StageStatus::deleted() },
            album_art: AlbumArtStage { existed: false, status: StageStatus::deleted() },
            structure_cache: StructureCacheStage { entries: 2, status: StageStatus::deleted() },
            markdown: StageStatus::deleted(),
            source_object: StageStatus::skipped(),
            overall: "deleted".to_string(),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["chromadb"]["visual_embeddings"], 3);
        assert_eq!(value["chromadb"]["status"], "deleted");
        assert_eq!(value["page_images"]["pages"], 3);
        assert_eq!(value["source_object"]["status"], "skipped");
        assert_eq!(value["overall"], "deleted");
    }
}
