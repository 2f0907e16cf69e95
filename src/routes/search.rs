//! Search endpoint.

use axum::{Json, extract::State};
use serde::Deserialize;

use crate::error::AppResult;
use crate::search::{SearchMode, SearchResponse};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub num_results: Option<usize>,
    #[serde(default)]
    pub mode: Option<SearchMode>,
}

/// `POST /search` — hybrid two-stage retrieval.
pub async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> AppResult<Json<SearchResponse>> {
    let mode = request.mode.unwrap_or_default();
    let response = state
        .search
        .search(&request.query, request.num_results, mode)
        .await?;
    Ok(Json(response))
}
