//! Upload registration and duplicate detection.
//!
//! The canonical `doc_id` is a pure function of name + content, so it only
//! exists once the object does.  Registration runs before the upload, so
//! duplicates are detected by filename (in-flight jobs first, then the
//! durable store) and report the existing document's real id; fresh
//! registrations get the `filename+ts` form of the id.  The event path
//! consults [`Registry::should_ingest`] before admitting a job.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::AppResult;
use crate::ids;
use crate::jobs::JobQueue;
use crate::vector_store::VectorStoreClient;

#[derive(Debug, Clone, Deserialize)]
pub struct FileSpec {
    pub filename: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadRegistration {
    pub filename: String,
    pub doc_id: String,
    pub expected_size: u64,
    pub is_duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_doc: Option<Value>,
}

pub struct Registry {
    store: Arc<VectorStoreClient>,
    queue: Arc<JobQueue>,
}

impl Registry {
    pub fn new(store: Arc<VectorStoreClient>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn register_upload_batch(
        &self,
        files: &[FileSpec],
        _force_upload: bool,
    ) -> AppResult<Vec<UploadRegistration>> {
        let mut registrations = Vec::with_capacity(files.len());
        for file in files {
            if let Some(job) = self.queue.in_flight_by_filename(&file.filename) {
                registrations.push(UploadRegistration {
                    filename: file.filename.clone(),
                    doc_id: job.doc_id,
                    expected_size: file.size,
                    is_duplicate: true,
                    existing_doc: None,
                });
                continue;
            }

            match self.store.find_document_by_filename(&file.filename).await? {
                Some(existing) => {
                    let doc_id = existing
                        .get("doc_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    registrations.push(UploadRegistration {
                        filename: file.filename.clone(),
                        doc_id,
                        expected_size: file.size,
                        is_duplicate: true,
                        existing_doc: Some(Value::Object(existing)),
                    });
                }
                None => {
                    registrations.push(UploadRegistration {
                        filename: file.filename.clone(),
                        doc_id: ids::derive_provisional_doc_id(
                            &file.filename,
                            Utc::now().timestamp(),
                        ),
                        expected_size: file.size,
                        is_duplicate: false,
                        existing_doc: None,
                    });
                }
            }
        }
        Ok(registrations)
    }

    /// Whether the event path should admit a new job for this document.
    /// Without `force_upload`, already-ingested documents are declined
    /// (in-flight duplicates are collapsed by the queue itself).
    pub async fn should_ingest(&self, doc_id: &str, force_upload: bool) -> AppResult<bool> {
        if force_upload {
            return Ok(true);
        }
        Ok(!self.store.document_exists(doc_id).await?)
    }
}
