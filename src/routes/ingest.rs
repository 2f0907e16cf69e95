//! Object-store event webhook and job management.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::ids;
use crate::jobs::EnqueueOutcome;
use crate::parser::DocumentSource;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct S3EventNotification {
    #[serde(rename = "EventName", default)]
    pub event_name: Option<String>,
    #[serde(rename = "Records", default)]
    pub records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
pub struct S3Record {
    #[serde(rename = "eventName", default)]
    pub event_name: Option<String>,
    pub s3: S3Entity,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "eTag", default)]
    pub e_tag: Option<String>,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
}

/// S3 object keys arrive URL-encoded.
fn decode_s3_key(key: &str) -> String {
    let plus_decoded = key.replace('+', " ");
    let bytes = plus_decoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&plus_decoded[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or(plus_decoded)
}

/// `POST /s3-event` — the upload surface's notification webhook.
/// Created objects are enqueued (duplicates are declined without
/// `force_upload`); removed objects trigger the delete coordinator.
pub async fn s3_event(
    State(state): State<AppState>,
    Json(notification): Json<S3EventNotification>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut events_processed = 0usize;

    for record in &notification.records {
        let event_name = record
            .event_name
            .as_deref()
            .or(notification.event_name.as_deref())
            .unwrap_or("");
        let bucket = &record.s3.bucket.name;
        let key = decode_s3_key(&record.s3.object.key);

        if bucket != &state.config.uploads_bucket {
            warn!(bucket, key, "event for foreign bucket ignored");
            continue;
        }
        if !ids::validate_object_key(&key) {
            return Err(AppError::AccessDenied(format!("invalid object key '{}'", key)));
        }

        if event_name.starts_with("s3:ObjectCreated:") {
            let filename = ids::basename(&key).to_string();
            if crate::parser::classify_filename(&filename).is_none() {
                warn!(key, "unsupported format, event ignored");
                continue;
            }
            let source = DocumentSource {
                bucket: bucket.clone(),
                key: key.clone(),
                filename,
                size: record.s3.object.size,
                content_tag: record.s3.object.e_tag.clone(),
            };
            let doc_id = source.doc_id();
            if !state.registry.should_ingest(&doc_id, false).await? {
                info!(doc_id, key, "duplicate upload declined");
                events_processed += 1;
                continue;
            }
            match state.queue.enqueue(source)? {
                EnqueueOutcome::Enqueued { job_id, doc_id } => {
                    let content_type = record.s3.object.content_type.as_deref().unwrap_or("");
                    info!(job_id, doc_id, key, content_type, "job enqueued");
                }
                EnqueueOutcome::Duplicate { job_id, doc_id } => {
                    info!(job_id, doc_id, key, "collapsed onto in-flight job");
                }
            }
            events_processed += 1;
        } else if event_name.starts_with("s3:ObjectRemoved:") {
            let delete = state.delete.clone();
            let store = state.store.clone();
            let e_tag = record.s3.object.e_tag.clone();
            let removed_key = key.clone();
            // Deletion fans out across several stores; run it off the
            // webhook's latency path.
            tokio::spawn(async move {
                // The durable key→doc mapping lives in embedding metadata;
                // the eTag derivation is the fallback for documents whose
                // metadata never landed.
                let doc_id = match store.find_doc_id_by_source_key(&removed_key).await {
                    Ok(Some(id)) => Some(id),
                    Ok(None) => e_tag.map(|tag| {
                        ids::derive_doc_id(
                            ids::basename(&removed_key),
                            ids::normalize_etag(&tag),
                        )
                    }),
                    Err(e) => {
                        warn!(key = %removed_key, error = %e, "source-key lookup failed");
                        None
                    }
                };
                match doc_id {
                    Some(doc_id) => match delete.delete_document(&doc_id).await {
                        Ok(report) => {
                            info!(doc_id, overall = %report.overall, "event-driven deletion")
                        }
                        Err(e) => warn!(doc_id, error = %e, "event-driven deletion failed"),
                    },
                    None => warn!(key = %removed_key, "no document found for removed object"),
                }
            });
            events_processed += 1;
        } else {
            warn!(event_name, key, "unsupported event ignored");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "events_processed": events_processed })),
    ))
}

/// `DELETE /jobs/{job_id}` — cooperative cancellation.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    state.queue.cancel(&job_id)?;
    let record = state.queue.record(&job_id);
    Ok(Json(json!({ "status": "cancelling", "job": record })))
}

/// `GET /jobs/{job_id}` — job record lookup.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    match state.queue.record(&job_id) {
        Some(record) => Ok(Json(serde_json::to_value(record)?)),
        None => Err(AppError::NotFound(format!("job {}", job_id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_key_decoding() {
        assert_eq!(decode_s3_key("q4.pdf"), "q4.pdf");
        assert_eq!(decode_s3_key("annual+report.pdf"), "annual report.pdf");
        assert_eq!(decode_s3_key("caf%C3%A9.pdf"), "café.pdf");
        assert_eq!(decode_s3_key("a%2Fb.pdf"), "a/b.pdf");
    }

    #[test]
    fn notification_parses_minio_shape() {
        let body = json!({
            "EventName": "s3:ObjectCreated:Put",
            "Key": "uploads/q4.pdf",
            "Records": [{
                "eventName": "s3:ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "uploads" },
                    "object": {
                        "key": "q4.pdf",
                        "size": 1048576,
                        "eTag": "\"9bb58f26192e4ba00f01e2e7b136bbd8\"",
                        "contentType": "application/pdf"
                    }
                }
            }]
        });
        let parsed: S3EventNotification = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.event_name.as_deref(), Some("s3:ObjectCreated:Put"));
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].s3.object.key, "q4.pdf");
        assert_eq!(parsed.records[0].s3.object.size, 1048576);
        assert_eq!(
            parsed.records[0].s3.object.e_tag.as_deref(),
            Some("\"9bb58f26192e4ba00f01e2e7b136bbd8\"")
        );
    }

    #[test]
    fn event_etag_drives_document_identity() {
        let source = |etag: &str| DocumentSource {
            bucket: "uploads".to_string(),
            key: "q4.pdf".to_string(),
            filename: "q4.pdf".to_string(),
            size: 1048576,
            content_tag: Some(etag.to_string()),
        };
        // Identical content re-uploaded: identical id.
        assert_eq!(source("\"abc\"").doc_id(), source("\"abc\"").doc_id());
        // Same name, new content: a distinct document.
        assert_ne!(source("\"abc\"").doc_id(), source("\"def\"").doc_id());
    }
}
