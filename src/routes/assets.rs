//! Asset serving and presign helpers.

use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::AppResult;
use crate::ids;
use crate::state::AppState;

/// `GET /assets/{doc_id}/{filename}` — strict id and filename validation,
/// long-lived cache headers (assets are immutable once written).
pub async fn serve_asset(
    State(state): State<AppState>,
    Path((doc_id, filename)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let path = state.assets.resolve(&doc_id, &filename)?;
    let bytes = tokio::fs::read(&path).await?;

    let content_type = if filename.ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, "max-age=86400".to_string()),
        ],
        bytes,
    ))
}

#[derive(Debug, Deserialize)]
pub struct PresignUploadRequest {
    pub filename: String,
    #[serde(rename = "contentType", default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub force_upload: bool,
}

/// `POST /upload/presign` — delegate to the object store's presign helper
/// and attach a document id.  The canonical id needs the uploaded content,
/// so the presign response carries the `filename+ts` form; re-presigning a
/// filename that already resolves to an ingested document without
/// `force_upload` is a 409 carrying the existing descriptor.
pub async fn presign_upload(
    State(state): State<AppState>,
    Json(request): Json<PresignUploadRequest>,
) -> AppResult<Json<Value>> {
    if !request.force_upload {
        if let Some(existing) = state
            .store
            .find_document_by_filename(&request.filename)
            .await?
        {
            let doc_id = existing
                .get("doc_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Err(crate::error::AppError::Duplicate {
                doc_id,
                existing: Value::Object(existing),
            });
        }
    }
    let doc_id =
        ids::derive_provisional_doc_id(&request.filename, chrono::Utc::now().timestamp());

    let content_type = request
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    let presigned = state
        .object_store
        .presign_upload(&request.filename, content_type, request.size)
        .await?;

    Ok(Json(json!({
        "uploadUrl": presigned.get("uploadUrl").cloned().unwrap_or(Value::Null),
        "docId": doc_id,
        "expiresIn": presigned.get("expiresIn").cloned().unwrap_or(Value::Null),
    })))
}

#[derive(Debug, Deserialize)]
pub struct PresignGetRequest {
    pub bucket: String,
    pub key: String,
}

/// `POST /assets/presign` — presigned GET for a stored object.
pub async fn presign_get(
    State(state): State<AppState>,
    Json(request): Json<PresignGetRequest>,
) -> AppResult<Json<Value>> {
    let presigned = state
        .object_store
        .presign_get(&request.bucket, &request.key)
        .await?;
    Ok(Json(json!({
        "url": presigned.get("url").cloned().unwrap_or(Value::Null),
        "expiresIn": presigned.get("expiresIn").cloned().unwrap_or(Value::Null),
    })))
}
