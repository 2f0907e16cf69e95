//! Research endpoint.

use axum::{Json, extract::State};

use crate::error::AppResult;
use crate::research::{ResearchRequest, ResearchResponse};
use crate::state::AppState;

/// `POST /api/research/ask` — retrieval-augmented answer with citations.
pub async fn ask(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> AppResult<Json<ResearchResponse>> {
    let response = state.research.ask(&request).await?;
    Ok(Json(response))
}
