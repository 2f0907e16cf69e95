//! Hybrid two-stage search.
//!
//! Stage 1 asks the vector DB for ANN candidates against the mean-pooled
//! query vector, per collection.  Stage 2 pulls each candidate's full
//! multi-vector out of its metadata sidecar and rescores with the
//! late-interaction sum-of-max: `S(Q,D) = Σᵢ maxⱼ ⟨qᵢ,dⱼ⟩`.  Scores are
//! min-max normalised per collection, fused under the mode weight, then
//! deduplicated on `(doc_id, page)` keeping the best representative.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{AppConfig, MAX_QUERY_LENGTH};
use crate::encoder::{EncoderClient, MultiVector};
use crate::error::{AppError, AppResult};
use crate::vector_store::{Candidate, Collection, VectorStoreClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Visual,
    Text,
    #[default]
    Hybrid,
}

impl SearchMode {
    /// Mode weight for the visual side of the fusion.
    fn alpha(&self, hybrid_alpha: f32) -> f32 {
        match self {
            SearchMode::Visual => 1.0,
            SearchMode::Text => 0.0,
            SearchMode::Hybrid => hybrid_alpha,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Visual,
    Text,
    Both,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub filename: String,
    pub page: usize,
    pub score: f32,
    #[serde(rename = "type")]
    pub match_type: MatchType,
    pub preview: String,
    /// Best-scoring chunk for text matches; used by the research engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(skip)]
    pub upload_ts: u64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub latency_ms: u64,
}

/// A candidate after late-interaction rescoring, before fusion.
#[derive(Debug, Clone)]
struct ScoredItem {
    doc_id: String,
    page: usize,
    filename: String,
    upload_ts: u64,
    preview: String,
    chunk_id: Option<String>,
    score: f32,
}

pub struct SearchEngine {
    encoder: Arc<EncoderClient>,
    store: Arc<VectorStoreClient>,
    candidates_k: usize,
    default_results: usize,
    hybrid_alpha: f32,
}

impl SearchEngine {
    pub fn new(
        encoder: Arc<EncoderClient>,
        store: Arc<VectorStoreClient>,
        config: &AppConfig,
    ) -> Self {
        Self {
            encoder,
            store,
            candidates_k: config.search_candidates_k,
            default_results: config.search_default_results,
            hybrid_alpha: config.hybrid_alpha,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        num_results: Option<usize>,
        mode: SearchMode,
    ) -> AppResult<SearchResponse> {
        let started = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput("query must not be empty".into()));
        }
        if query.len() > MAX_QUERY_LENGTH {
            return Err(AppError::InvalidInput(format!(
                "query too long ({} chars, max {})",
                query.len(),
                MAX_QUERY_LENGTH
            )));
        }
        let limit = num_results.unwrap_or(self.default_results).clamp(1, 100);

        let query_vec = self.encoder.embed_query(query).await?;
        let pooled = query_vec.mean_pooled();

        let visual = if mode != SearchMode::Text {
            self.rescore_collection(Collection::Visual, &pooled, &query_vec)
                .await?
        } else {
            Vec::new()
        };
        let text = if mode != SearchMode::Visual {
            self.rescore_collection(Collection::Text, &pooled, &query_vec)
                .await?
        } else {
            Vec::new()
        };

        let alpha = mode.alpha(self.hybrid_alpha);
        let mut hits = fuse_and_dedup(visual, text, alpha);
        hits.truncate(limit);

        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(query, results = hits.len(), latency_ms, "search complete");

        Ok(SearchResponse {
            query: query.to_string(),
            results: hits,
            latency_ms,
        })
    }

    async fn rescore_collection(
        &self,
        collection: Collection,
        pooled: &[f32],
        query_vec: &MultiVector,
    ) -> AppResult<Vec<ScoredItem>> {
        let candidates = self
            .store
            .query(collection, pooled, self.candidates_k, None)
            .await?;
        Ok(rescore_candidates(collection, candidates, query_vec))
    }
}

/// Late-interaction sum-of-max score.
pub fn late_interaction_score(query: &MultiVector, doc: &MultiVector) -> f32 {
    if query.dim != doc.dim || doc.tokens() == 0 {
        return 0.0;
    }
    let mut total = 0.0f32;
    for qi in 0..query.tokens() {
        let q = query.row(qi);
        let mut best = f32::NEG_INFINITY;
        for di in 0..doc.tokens() {
            let d = doc.row(di);
            let dot: f32 = q.iter().zip(d).map(|(a, b)| a * b).sum();
            if dot > best {
                best = dot;
            }
        }
        total += best;
    }
    total
}

/// Stage-2 rescoring of one collection's candidates.  Candidates whose
/// sidecar is missing or corrupt are skipped with a warning; corruption is
/// logged with the embedding id but never fails the search.
fn rescore_candidates(
    collection: Collection,
    candidates: Vec<Candidate>,
    query_vec: &MultiVector,
) -> Vec<ScoredItem> {
    use rayon::prelude::*;

    // Sum-of-max over full multi-vectors is the expensive part of a search;
    // candidates score independently, and par_iter keeps input order.
    let mut scored: Vec<ScoredItem> = candidates
        .par_iter()
        .filter_map(|candidate| {
            // Placeholder records exist only so empty documents stay resolvable.
            if candidate
                .metadata
                .get("placeholder")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                return None;
            }
            let multivec = match candidate.multivector() {
                Ok(Some(mv)) => mv,
                Ok(None) => return None,
                Err(e) => {
                    warn!(
                        embedding_id = %candidate.embedding_id,
                        collection = collection.name(),
                        error = %e,
                        "skipping candidate with corrupt sidecar"
                    );
                    return None;
                }
            };
            let doc_id = candidate.str_field("doc_id")?;
            let page = candidate.u64_field("page").unwrap_or(1) as usize;
            tracing::trace!(
                embedding_id = %candidate.embedding_id,
                ann_distance = candidate.distance,
                "rescoring candidate"
            );
            Some(ScoredItem {
                doc_id: doc_id.to_string(),
                page,
                filename: candidate.str_field("filename").unwrap_or("").to_string(),
                upload_ts: candidate.u64_field("upload_ts").unwrap_or(0),
                preview: candidate.str_field("preview").unwrap_or("").to_string(),
                chunk_id: candidate.str_field("chunk_id").map(|s| s.to_string()),
                score: late_interaction_score(query_vec, &multivec),
            })
        })
        .collect();

    let normalised = min_max_normalize(&scored.iter().map(|s| s.score).collect::<Vec<_>>());
    for (item, norm) in scored.iter_mut().zip(normalised) {
        item.score = norm;
    }
    scored
}

/// Min-max normalisation over a candidate set.  A degenerate set (all equal)
/// maps to 1.0 so a lone candidate is not zeroed out.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let Some(&first) = scores.first() else {
        return Vec::new();
    };
    let (min, max) = scores.iter().fold((first, first), |(lo, hi), &s| {
        (lo.min(s), hi.max(s))
    });
    let span = max - min;
    if span <= f32::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|&s| (s - min) / span).collect()
}

/// Fuse per-collection scores and collapse `(doc_id, page)` duplicates.
/// Within one collection the best-scoring representative wins; across
/// collections the fused score is `α·Sv + (1−α)·St` with 0 for the absent
/// side.  Ordering: fused score desc, then earlier upload, then lower page.
fn fuse_and_dedup(visual: Vec<ScoredItem>, text: Vec<ScoredItem>, alpha: f32) -> Vec<SearchHit> {
    struct Fused {
        visual: Option<ScoredItem>,
        text: Option<ScoredItem>,
    }

    let mut merged: HashMap<(String, usize), Fused> = HashMap::new();

    for item in visual {
        let entry = merged
            .entry((item.doc_id.clone(), item.page))
            .or_insert(Fused { visual: None, text: None });
        if entry.visual.as_ref().is_none_or(|v| item.score > v.score) {
            entry.visual = Some(item);
        }
    }
    for item in text {
        let entry = merged
            .entry((item.doc_id.clone(), item.page))
            .or_insert(Fused { visual: None, text: None });
        if entry.text.as_ref().is_none_or(|t| item.score > t.score) {
            entry.text = Some(item);
        }
    }

    let mut hits: Vec<SearchHit> = merged
        .into_values()
        .map(|f| {
            let sv = f.visual.as_ref().map(|v| v.score).unwrap_or(0.0);
            let st = f.text.as_ref().map(|t| t.score).unwrap_or(0.0);
            let score = alpha * sv + (1.0 - alpha) * st;
            let match_type = match (&f.visual, &f.text) {
                (Some(_), Some(_)) => MatchType::Both,
                (Some(_), None) => MatchType::Visual,
                (None, Some(_)) => MatchType::Text,
                (None, None) => unreachable!("fused entry without either side"),
            };
            // Prefer the text side's preview and chunk linkage when present;
            // its chunk text reads better than a page excerpt.
            let primary = f.text.as_ref().or(f.visual.as_ref()).unwrap();
            SearchHit {
                doc_id: primary.doc_id.clone(),
                filename: primary.filename.clone(),
                page: primary.page,
                score,
                match_type,
                preview: primary.preview.clone(),
                chunk_id: f.text.as_ref().and_then(|t| t.chunk_id.clone()),
                upload_ts: primary.upload_ts,
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.upload_ts.cmp(&b.upload_ts))
            .then_with(|| a.page.cmp(&b.page))
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(rows: &[&[f32]]) -> MultiVector {
        MultiVector::from_rows(rows.iter().map(|r| r.to_vec()).collect()).unwrap()
    }

    fn item(doc: &str, page: usize, score: f32, ts: u64) -> ScoredItem {
        ScoredItem {
            doc_id: doc.to_string(),
            page,
            filename: format!("{}.pdf", doc),
            upload_ts: ts,
            preview: String::new(),
            chunk_id: None,
            score,
        }
    }

    #[test]
    fn sum_of_max_scoring() {
        let query = mv(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let doc = mv(&[&[0.8, 0.0], &[0.0, 0.5], &[0.1, 0.9]]);
        // q0: max(0.8, 0.0, 0.1) = 0.8; q1: max(0.0, 0.5, 0.9) = 0.9
        let score = late_interaction_score(&query, &doc);
        assert!((score - 1.7).abs() < 1e-6);
    }

    #[test]
    fn scoring_dim_mismatch_is_zero() {
        let query = mv(&[&[1.0, 0.0]]);
        let doc = mv(&[&[1.0, 0.0, 0.0]]);
        assert_eq!(late_interaction_score(&query, &doc), 0.0);
    }

    #[test]
    fn min_max_bounds_and_degenerate_sets() {
        let norm = min_max_normalize(&[2.0, 4.0, 3.0]);
        assert_eq!(norm[0], 0.0);
        assert_eq!(norm[1], 1.0);
        assert!((norm[2] - 0.5).abs() < 1e-6);
        assert!(norm.iter().all(|&s| (0.0..=1.0).contains(&s)));

        assert_eq!(min_max_normalize(&[7.0, 7.0]), vec![1.0, 1.0]);
        assert_eq!(min_max_normalize(&[7.0]), vec![1.0]);
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn dedup_collapses_doc_page_pairs() {
        let visual = vec![item("a", 1, 0.9, 100), item("a", 2, 0.5, 100)];
        let text = vec![item("a", 1, 0.7, 100), item("b", 1, 0.6, 50)];
        let hits = fuse_and_dedup(visual, text, 0.5);

        let mut seen = std::collections::HashSet::new();
        for hit in &hits {
            assert!(seen.insert((hit.doc_id.clone(), hit.page)));
        }
        assert_eq!(hits.len(), 3);

        let both = hits
            .iter()
            .find(|h| h.doc_id == "a" && h.page == 1)
            .unwrap();
        assert_eq!(both.match_type, MatchType::Both);
        assert!((both.score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn absent_side_contributes_zero() {
        let hits = fuse_and_dedup(vec![item("a", 1, 1.0, 0)], vec![], 0.5);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.5).abs() < 1e-6);
        assert_eq!(hits[0].match_type, MatchType::Visual);
    }

    #[test]
    fn mode_weights() {
        assert_eq!(SearchMode::Visual.alpha(0.3), 1.0);
        assert_eq!(SearchMode::Text.alpha(0.3), 0.0);
        assert_eq!(SearchMode::Hybrid.alpha(0.3), 0.3);
    }

    #[test]
    fn ordering_and_tie_breaks() {
        // Equal fused scores: earlier upload_ts wins, then lower page.
        let text = vec![
            item("late", 1, 1.0, 200),
            item("early", 2, 1.0, 100),
            item("early", 1, 1.0, 100),
        ];
        let hits = fuse_and_dedup(vec![], text, 0.0);
        assert_eq!(hits[0].doc_id, "early");
        assert_eq!(hits[0].page, 1);
        assert_eq!(hits[1].doc_id, "early");
        assert_eq!(hits[1].page, 2);
        assert_eq!(hits[2].doc_id, "late");
    }

    #[test]
    fn fused_scores_stay_in_unit_interval() {
        let visual = vec![item("a", 1, 1.0, 0), item("b", 1, 0.0, 0)];
        let text = vec![item("a", 1, 1.0, 0), item("c", 1, 0.4, 0)];
        for alpha in [0.0f32, 0.25, 0.5, 1.0] {
            let hits = fuse_and_dedup(visual.clone(), text.clone(), alpha);
            assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        }
    }
}
