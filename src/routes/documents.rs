//! Document CRUD, structure, chunk and markdown endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::delete::DeletionReport;
use crate::error::{AppError, AppResult};
use crate::ids;
use crate::state::AppState;
use crate::structure::{ChunkMarker, annotate_markdown};
use crate::vector_store::Collection;

fn validate_doc_id(doc_id: &str) -> AppResult<()> {
    if ids::is_valid_doc_id(doc_id) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!("malformed doc_id '{}'", doc_id)))
    }
}

/// `GET /documents/{doc_id}` — document-level metadata.
pub async fn get_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> AppResult<Json<Value>> {
    validate_doc_id(&doc_id)?;
    let metadata = state
        .store
        .get_document_metadata(&doc_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {}", doc_id)))?;

    // Chunk-level fields leak in from whichever embedding served the lookup.
    let mut doc: Map<String, Value> = metadata;
    for key in [
        "text", "preview", "chunk_id", "chunk_index", "prev_chunk_id", "next_chunk_id",
        "element_id", "element_type", "bbox_left", "bbox_bottom", "bbox_right", "bbox_top",
        "section_heading", "page", "placeholder",
    ] {
        doc.remove(key);
    }
    Ok(Json(Value::Object(doc)))
}

/// `DELETE /documents/{doc_id}` — staged deletion with a per-stage report.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> AppResult<Json<DeletionReport>> {
    let report = state.delete.delete_document(&doc_id).await?;
    Ok(Json(report))
}

/// `GET /documents/{doc_id}/pages/{page}/structure`.
/// Legacy documents (no structure) answer `has_structure: false` rather
/// than erroring.
pub async fn get_page_structure(
    State(state): State<AppState>,
    Path((doc_id, page)): Path<(String, usize)>,
) -> AppResult<Json<Value>> {
    validate_doc_id(&doc_id)?;
    if page == 0 {
        return Err(AppError::InvalidInput("pages are 1-indexed".into()));
    }

    if let Some(structure) = state.structure.get(&doc_id, page).await? {
        return Ok(Json(serde_json::to_value(&*structure)?));
    }

    if !state.store.document_exists(&doc_id).await? {
        return Err(AppError::NotFound(format!("document {}", doc_id)));
    }

    // Legacy document: no structure is a valid answer, not an error.
    Ok(Json(serde_json::to_value(
        crate::structure::PageStructure::empty(page),
    )?))
}

/// `GET /documents/{doc_id}/chunks/{chunk_id}` — the chunk-level record.
pub async fn get_chunk(
    State(state): State<AppState>,
    Path((doc_id, chunk_id)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    validate_doc_id(&doc_id)?;
    let embedding_id = ids::text_embedding_id(&chunk_id);
    let Some((_, metadata)) = state.store.get(Collection::Text, &embedding_id).await? else {
        return Err(AppError::NotFound(format!("chunk {}", chunk_id)));
    };
    if metadata.get("doc_id").and_then(|v| v.as_str()) != Some(doc_id.as_str()) {
        return Err(AppError::NotFound(format!("chunk {}", chunk_id)));
    }

    let field = |key: &str| metadata.get(key).cloned().unwrap_or(Value::Null);
    let bbox = match (
        metadata.get("bbox_left").and_then(|v| v.as_f64()),
        metadata.get("bbox_bottom").and_then(|v| v.as_f64()),
        metadata.get("bbox_right").and_then(|v| v.as_f64()),
        metadata.get("bbox_top").and_then(|v| v.as_f64()),
    ) {
        (Some(l), Some(b), Some(r), Some(t)) => json!([l, b, r, t]),
        _ => Value::Null,
    };

    Ok(Json(json!({
        "chunk_id": chunk_id,
        "doc_id": doc_id,
        "page": field("page"),
        "index": field("chunk_index"),
        "text": field("text"),
        "element_id": field("element_id"),
        "element_type": field("element_type"),
        "bbox": bbox,
        "section_heading": field("section_heading"),
        "prev_chunk_id": field("prev_chunk_id"),
        "next_chunk_id": field("next_chunk_id"),
    })))
}

#[derive(Debug, Deserialize)]
pub struct MarkdownQuery {
    #[serde(default)]
    pub include_markers: bool,
}

/// `GET /documents/{doc_id}/markdown?include_markers=` — the full-document
/// markdown, optionally annotated with chunk markers (invisible when
/// rendered).
pub async fn get_markdown(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<MarkdownQuery>,
) -> AppResult<impl IntoResponse> {
    validate_doc_id(&doc_id)?;
    let markdown = state
        .store
        .get_document_markdown(&doc_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no markdown for document {}", doc_id)))?;

    let body = if query.include_markers {
        let markers = load_chunk_markers(&state, &doc_id).await?;
        annotate_markdown(&markdown, &markers)
    } else {
        markdown
    };

    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        body,
    ))
}

/// Rebuild chunk markers from stored chunk metadata, in chunk order.
async fn load_chunk_markers(state: &AppState, doc_id: &str) -> AppResult<Vec<ChunkMarker>> {
    let candidates = state
        .store
        .get_where(Collection::Text, &json!({ "doc_id": doc_id }), 1000)
        .await?;

    let mut markers: Vec<(usize, ChunkMarker)> = candidates
        .into_iter()
        .filter_map(|c| {
            let chunk_id = c.str_field("chunk_id")?.to_string();
            let index = c.u64_field("chunk_index")? as usize;
            let page = c.u64_field("page").unwrap_or(1) as usize;
            let text = c.str_field("text")?.to_string();
            let bbox = match (
                c.metadata.get("bbox_left").and_then(|v| v.as_f64()),
                c.metadata.get("bbox_bottom").and_then(|v| v.as_f64()),
                c.metadata.get("bbox_right").and_then(|v| v.as_f64()),
                c.metadata.get("bbox_top").and_then(|v| v.as_f64()),
            ) {
                (Some(l), Some(b), Some(r), Some(t)) => format!("{},{},{},{}", l, b, r, t),
                _ => "0,0,0,0".to_string(),
            };
            Some((index, ChunkMarker { chunk_id, page, bbox, text }))
        })
        .collect();

    markers.sort_by_key(|(index, _)| *index);
    Ok(markers.into_iter().map(|(_, m)| m).collect())
}
