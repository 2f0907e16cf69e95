//! Research engine.
//!
//! retrieval → context pack → optional local-model preprocessing →
//! foundation-model call → citation-parsed answer.
//!
//! Citation discipline: sources are numbered and the system prompt requires
//! every factual assertion to end with `[N]` markers.  Markers that
//! reference an unknown source are stripped from the answer and logged.
//! Preprocessing never renumbers sources: the filter strategy drops sources
//! but keeps the survivors' original numbers (the numbers the model sees and
//! cites), emitting an old→new mapping table.  The engine applies that table
//! when rewriting the model's raw `[N]` output, so the client still receives
//! a contiguous `1..k` numbering with every marker resolvable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::{AppConfig, LlmProviderKind, MAX_QUERY_LENGTH, MAX_RESEARCH_SOURCES, PreprocessStrategy};
use crate::error::{AppError, AppResult};
use crate::ids;
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};
use crate::search::{MatchType, SearchEngine, SearchMode};
use crate::vector_store::{Collection, VectorStoreClient};

static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").unwrap());

const SYSTEM_PROMPT: &str = "You are a research assistant answering questions from a document \
corpus. Use ONLY the numbered sources provided. Every factual assertion in your answer must end \
with one or more citation markers of the form [N], where N refers to the numbered source list. \
Do not invent sources or cite numbers outside the list. If the sources do not contain the \
answer, say so plainly.";

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchRequest {
    pub question: String,
    #[serde(default)]
    pub num_sources: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub preprocessing_enabled: Option<bool>,
    #[serde(default)]
    pub preprocessing_strategy: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRecord {
    pub citation_number: usize,
    pub doc_id: String,
    pub filename: String,
    pub page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub text: String,
    pub score: f32,
    #[serde(rename = "type")]
    pub match_type: MatchType,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreprocessingMetadata {
    pub enabled: bool,
    pub strategy: String,
    pub sources_in: usize,
    pub sources_out: usize,
    pub fallback: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ResearchResponse {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SourceRecord>,
    pub processing_time_ms: u64,
    pub model_used: String,
    pub sources_found: usize,
    pub context_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preprocessing_metadata: Option<PreprocessingMetadata>,
}

pub struct ResearchEngine {
    search: Arc<SearchEngine>,
    store: Arc<VectorStoreClient>,
    providers: HashMap<LlmProviderKind, Arc<dyn LlmProvider>>,
    default_provider: LlmProviderKind,
    local: Option<Arc<dyn LlmProvider>>,
    preprocess_enabled: bool,
    preprocess_strategy: PreprocessStrategy,
    preprocess_threshold: f64,
    preprocess_max_sources: usize,
    max_tokens: u32,
    temperature: f32,
}

impl ResearchEngine {
    pub fn new(
        search: Arc<SearchEngine>,
        store: Arc<VectorStoreClient>,
        providers: HashMap<LlmProviderKind, Arc<dyn LlmProvider>>,
        local: Option<Arc<dyn LlmProvider>>,
        config: &AppConfig,
    ) -> Self {
        Self {
            search,
            store,
            providers,
            default_provider: config.llm_provider,
            local,
            preprocess_enabled: config.preprocess_enabled,
            preprocess_strategy: config.preprocess_strategy,
            preprocess_threshold: config.preprocess_threshold,
            preprocess_max_sources: config.preprocess_max_sources,
            max_tokens: config.llm_max_tokens,
            temperature: config.llm_temperature,
        }
    }

    pub async fn ask(&self, request: &ResearchRequest) -> AppResult<ResearchResponse> {
        let started = Instant::now();
        let question = request.question.trim();
        if question.is_empty() {
            return Err(AppError::InvalidInput("question must not be empty".into()));
        }
        if question.len() > MAX_QUERY_LENGTH {
            return Err(AppError::InvalidInput(format!(
                "question too long ({} chars, max {})",
                question.len(),
                MAX_QUERY_LENGTH
            )));
        }

        let num_sources = request
            .num_sources
            .unwrap_or(10)
            .clamp(1, MAX_RESEARCH_SOURCES);

        let (provider, model_override) = self.resolve_provider(request.model.as_deref())?;

        // 1. Retrieve.
        let retrieval = self
            .search
            .search(question, Some(num_sources), SearchMode::Hybrid)
            .await?;
        let sources_found = retrieval.results.len();

        if retrieval.results.is_empty() {
            return Ok(ResearchResponse {
                question: question.to_string(),
                answer: "No relevant sources were found for this question.".to_string(),
                sources: Vec::new(),
                processing_time_ms: started.elapsed().as_millis() as u64,
                model_used: String::new(),
                sources_found: 0,
                context_truncated: false,
                preprocessing_metadata: None,
            });
        }

        // 2. Context pack within the provider's budget.
        let budget = provider.context_budget_tokens();
        let per_source_budget = (budget / retrieval.results.len()).max(64);
        let mut context_truncated = false;
        let mut sources = Vec::with_capacity(retrieval.results.len());
        for (i, hit) in retrieval.results.iter().enumerate() {
            let (text, truncated) = self.pack_source_text(hit, per_source_budget).await?;
            context_truncated |= truncated;
            sources.push(SourceRecord {
                citation_number: i + 1,
                doc_id: hit.doc_id.clone(),
                filename: hit.filename.clone(),
                page: hit.page,
                chunk_id: hit.chunk_id.clone(),
                text,
                score: hit.score,
                match_type: hit.match_type,
            });
        }

        // 3. Optional preprocessing with the local model.
        let preprocess_enabled = request
            .preprocessing_enabled
            .unwrap_or(self.preprocess_enabled);
        let strategy = request
            .preprocessing_strategy
            .as_deref()
            .and_then(PreprocessStrategy::parse)
            .unwrap_or(self.preprocess_strategy);

        let mut preprocessing_metadata = None;
        let mut citation_mapping: Option<HashMap<usize, usize>> = None;
        let mut packed_context = build_numbered_context(&sources);
        if preprocess_enabled {
            let pp_started = Instant::now();
            let sources_in = sources.len();
            match self.preprocess(&sources, strategy, question).await {
                Ok(PreprocessOutcome::Narrative(narrative)) => {
                    packed_context = narrative;
                    preprocessing_metadata = Some(PreprocessingMetadata {
                        enabled: true,
                        strategy: strategy.as_str().to_string(),
                        sources_in,
                        sources_out: sources.len(),
                        fallback: false,
                        duration_ms: pp_started.elapsed().as_millis() as u64,
                    });
                }
                Ok(PreprocessOutcome::Filtered { kept, mapping }) => {
                    // Survivors keep their original numbers all the way
                    // through the foundation call; the mapping is applied to
                    // the model's output, not to the prompt.
                    sources = kept;
                    packed_context = build_numbered_context(&sources);
                    citation_mapping = Some(mapping);
                    preprocessing_metadata = Some(PreprocessingMetadata {
                        enabled: true,
                        strategy: strategy.as_str().to_string(),
                        sources_in,
                        sources_out: sources.len(),
                        fallback: false,
                        duration_ms: pp_started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    // Lossy stage: fall back to the unprocessed sources.
                    warn!(error = %e, "preprocessing failed, using raw sources");
                    preprocessing_metadata = Some(PreprocessingMetadata {
                        enabled: true,
                        strategy: strategy.as_str().to_string(),
                        sources_in,
                        sources_out: sources_in,
                        fallback: true,
                        duration_ms: pp_started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        // 4–5. Prompt and invoke, with one retry on transient failure.
        let chat = ChatRequest {
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(format!(
                    "Sources:\n\n{}\n\nQuestion: {}",
                    packed_context, question
                )),
            ],
            model: model_override,
            max_tokens: self.max_tokens,
            temperature: request.temperature.unwrap_or(self.temperature),
        };

        let response = match provider.generate(&chat).await {
            Ok(r) => r,
            Err(e) if e.is_retryable() => {
                info!(error = %e, "provider call failed, retrying once");
                tokio::time::sleep(Duration::from_secs(2)).await;
                provider.generate(&chat).await?
            }
            Err(e) => return Err(e),
        };

        // 6. Parse and enforce citations.  When the filter strategy dropped
        // sources, the model cited original numbers; rewrite them through
        // the mapping table, then renumber the source list to match.
        let answer = match &citation_mapping {
            Some(mapping) => rewrite_citations(&response.text, mapping),
            None => strip_unknown_citations(&response.text, sources.len()),
        };
        if let Some(mapping) = &citation_mapping {
            sources = apply_citation_mapping(sources, mapping);
        }
        let cited = extract_citation_numbers(&answer);
        info!(
            question_chars = question.len(),
            sources = sources.len(),
            cited = cited.len(),
            model = %response.model,
            "research answer produced"
        );

        Ok(ResearchResponse {
            question: question.to_string(),
            answer,
            sources,
            processing_time_ms: started.elapsed().as_millis() as u64,
            model_used: response.model,
            sources_found,
            context_truncated,
            preprocessing_metadata,
        })
    }

    fn resolve_provider(
        &self,
        model: Option<&str>,
    ) -> AppResult<(Arc<dyn LlmProvider>, Option<String>)> {
        let lookup = |kind: LlmProviderKind| {
            self.providers.get(&kind).cloned().ok_or_else(|| {
                AppError::InvalidInput(format!("provider '{}' is not configured", kind.as_str()))
            })
        };

        match model {
            None => Ok((lookup(self.default_provider)?, None)),
            Some(selector) => {
                if let Some((provider_name, model_name)) = selector.split_once(':') {
                    let kind = LlmProviderKind::parse(provider_name).ok_or_else(|| {
                        AppError::InvalidInput(format!("unknown provider '{}'", provider_name))
                    })?;
                    Ok((lookup(kind)?, Some(model_name.to_string())))
                } else if let Some(kind) = LlmProviderKind::parse(selector) {
                    Ok((lookup(kind)?, None))
                } else {
                    Ok((lookup(self.default_provider)?, Some(selector.to_string())))
                }
            }
        }
    }

    /// Pull the hit's chunk text plus its prev/next neighbours, bounded by a
    /// per-source token budget.
    async fn pack_source_text(
        &self,
        hit: &crate::search::SearchHit,
        budget_tokens: usize,
    ) -> AppResult<(String, bool)> {
        let Some(chunk_id) = &hit.chunk_id else {
            // Visual-only hit: the stored preview is all the text we have.
            return Ok((hit.preview.clone(), false));
        };

        let Some((_, metadata)) = self
            .store
            .get(Collection::Text, &ids::text_embedding_id(chunk_id))
            .await?
        else {
            return Ok((hit.preview.clone(), false));
        };

        let core = metadata
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or(&hit.preview)
            .to_string();

        let mut truncated = false;
        let mut parts = vec![core.clone()];
        let mut used = approx_token_count(&core);
        if used > budget_tokens {
            let clipped = clip_to_tokens(&core, budget_tokens);
            return Ok((clipped, true));
        }

        for (key, front) in [("prev_chunk_id", true), ("next_chunk_id", false)] {
            let Some(neighbour_id) = metadata.get(key).and_then(|v| v.as_str()) else {
                continue;
            };
            let Some((_, n_meta)) = self
                .store
                .get(Collection::Text, &ids::text_embedding_id(neighbour_id))
                .await?
            else {
                continue;
            };
            let Some(n_text) = n_meta.get("text").and_then(|v| v.as_str()) else {
                continue;
            };
            let cost = approx_token_count(n_text);
            if used + cost > budget_tokens {
                truncated = true;
                continue;
            }
            used += cost;
            if front {
                parts.insert(0, n_text.to_string());
            } else {
                parts.push(n_text.to_string());
            }
        }

        Ok((parts.join("\n"), truncated))
    }

    async fn preprocess(
        &self,
        sources: &[SourceRecord],
        strategy: PreprocessStrategy,
        question: &str,
    ) -> AppResult<PreprocessOutcome> {
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| AppError::InvalidInput("no local model configured".into()))?;

        let sources = &sources[..sources.len().min(self.preprocess_max_sources)];
        let numbered = build_numbered_context(sources);

        match strategy {
            PreprocessStrategy::Compress | PreprocessStrategy::Synthesize => {
                let verb = match strategy {
                    PreprocessStrategy::Synthesize => "Synthesize",
                    _ => "Compress",
                };
                let chat = ChatRequest {
                    messages: vec![
                        ChatMessage::system(
                            "You condense retrieved sources for a downstream answerer. Preserve \
                             every numeric citation marker [N] exactly as written; never renumber \
                             or drop them.",
                        ),
                        ChatMessage::user(format!(
                            "{} the following sources into one coherent narrative relevant to \
                             the question \"{}\", keeping the [N] markers attached to their \
                             facts:\n\n{}",
                            verb, question, numbered
                        )),
                    ],
                    model: None,
                    max_tokens: self.max_tokens,
                    temperature: 0.1,
                };
                let response = local.generate(&chat).await?;
                Ok(PreprocessOutcome::Narrative(response.text))
            }
            PreprocessStrategy::Filter => {
                let chat = ChatRequest {
                    messages: vec![
                        ChatMessage::system(
                            "You rate source relevance. Reply with ONLY a JSON array of numbers, \
                             one score from 0 to 10 per source, in order.",
                        ),
                        ChatMessage::user(format!(
                            "Question: {}\n\nScore each source:\n\n{}",
                            question, numbered
                        )),
                    ],
                    model: None,
                    max_tokens: 256,
                    temperature: 0.0,
                };
                let response = local.generate(&chat).await?;
                let scores = parse_score_array(&response.text, sources.len()).ok_or_else(|| {
                    AppError::Dependency("filter preprocessing returned unparseable scores".into())
                })?;
                // Survivors keep their ORIGINAL citation numbers and their
                // original ordering; the mapping records what each number
                // becomes once the dropped sources close the gaps.
                let kept: Vec<SourceRecord> = sources
                    .iter()
                    .zip(&scores)
                    .filter(|&(_, &score)| score >= self.preprocess_threshold)
                    .map(|(s, _)| s.clone())
                    .collect();
                if kept.is_empty() {
                    // Dropping everything would leave the model blind.
                    return Err(AppError::Dependency(
                        "filter preprocessing rejected all sources".into(),
                    ));
                }
                let mapping: HashMap<usize, usize> = kept
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (s.citation_number, i + 1))
                    .collect();
                Ok(PreprocessOutcome::Filtered { kept, mapping })
            }
        }
    }
}

enum PreprocessOutcome {
    Narrative(String),
    Filtered {
        kept: Vec<SourceRecord>,
        /// Original citation number → post-collapse number.
        mapping: HashMap<usize, usize>,
    },
}

/// Rough token estimate: four characters per token.
pub fn approx_token_count(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn clip_to_tokens(text: &str, budget_tokens: usize) -> String {
    let max_bytes = budget_tokens * 4;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Render the numbered source list the model sees.
pub fn build_numbered_context(sources: &[SourceRecord]) -> String {
    sources
        .iter()
        .map(|s| {
            format!(
                "[{}] ({}, page {}):\n{}",
                s.citation_number, s.filename, s.page, s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Citation numbers referenced by an answer, in order of first appearance.
pub fn extract_citation_numbers(answer: &str) -> Vec<usize> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for cap in CITATION_RE.captures_iter(answer) {
        if let Ok(n) = cap[1].parse::<usize>() {
            if seen.insert(n) {
                out.push(n);
            }
        }
    }
    out
}

/// Remove `[N]` markers that reference a source outside `1..=max`, logging
/// each drop.
pub fn strip_unknown_citations(answer: &str, max: usize) -> String {
    CITATION_RE
        .replace_all(answer, |caps: &regex::Captures| {
            match caps[1].parse::<usize>() {
                Ok(n) if (1..=max).contains(&n) => caps[0].to_string(),
                _ => {
                    warn!(marker = %&caps[0], "dropping citation to unknown source");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Rewrite raw `[N]` markers through the filter mapping table.  Markers that
/// reference a dropped or unknown source are removed and logged.
pub fn rewrite_citations(answer: &str, mapping: &HashMap<usize, usize>) -> String {
    CITATION_RE
        .replace_all(answer, |caps: &regex::Captures| {
            match caps[1].parse::<usize>().ok().and_then(|n| mapping.get(&n)) {
                Some(new) => format!("[{}]", new),
                None => {
                    warn!(marker = %&caps[0], "dropping citation to dropped or unknown source");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Apply the filter mapping to the source records themselves, yielding the
/// contiguous `1..k` numbering the rewritten answer refers to.
fn apply_citation_mapping(
    mut sources: Vec<SourceRecord>,
    mapping: &HashMap<usize, usize>,
) -> Vec<SourceRecord> {
    for source in sources.iter_mut() {
        if let Some(new) = mapping.get(&source.citation_number) {
            source.citation_number = *new;
        }
    }
    sources.sort_by_key(|s| s.citation_number);
    sources
}

/// Find a JSON number array of the expected length anywhere in the reply.
fn parse_score_array(text: &str, expected_len: usize) -> Option<Vec<f64>> {
    let start = text.find('[')?;
    let end = text[start..].find(']')? + start + 1;
    let parsed: Value = serde_json::from_str(&text[start..end]).ok()?;
    let items = parsed.as_array()?;
    if items.len() != expected_len {
        return None;
    }
    items.iter().map(|v| v.as_f64()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(n: usize, text: &str) -> SourceRecord {
        SourceRecord {
            citation_number: n,
            doc_id: format!("doc{}", n),
            filename: format!("doc{}.pdf", n),
            page: 1,
            chunk_id: None,
            text: text.to_string(),
            score: 0.5,
            match_type: MatchType::Text,
        }
    }

    #[test]
    fn citation_extraction() {
        let answer = "Revenue rose [1]. Costs fell [2][1]. Margins expanded [3].";
        assert_eq!(extract_citation_numbers(answer), vec![1, 2, 3]);
        assert!(extract_citation_numbers("no markers here").is_empty());
    }

    #[test]
    fn unknown_citations_are_stripped() {
        let answer = "Fine [1]. Bogus [7]. Zero [0]. Also fine [2].";
        let cleaned = strip_unknown_citations(answer, 2);
        assert_eq!(cleaned, "Fine [1]. Bogus . Zero . Also fine [2].");
        // Every surviving marker resolves.
        for n in extract_citation_numbers(&cleaned) {
            assert!((1..=2).contains(&n));
        }
    }

    #[test]
    fn filter_mapping_rewrites_model_output() {
        // Sources 1, 3 and 5 survived the filter; 2 and 4 were dropped.
        let mapping: HashMap<usize, usize> = [(1, 1), (3, 2), (5, 3)].into_iter().collect();

        let raw = "First [1]. Third [3]. Fifth [5]. Dropped [2]. Bogus [9].";
        let rewritten = rewrite_citations(raw, &mapping);
        assert_eq!(rewritten, "First [1]. Third [2]. Fifth [3]. Dropped . Bogus .");
    }

    #[test]
    fn applying_the_mapping_yields_contiguous_numbers() {
        let mapping: HashMap<usize, usize> = [(1, 1), (3, 2), (5, 3)].into_iter().collect();
        let kept = vec![source(1, "a"), source(3, "c"), source(5, "e")];
        let applied = apply_citation_mapping(kept, &mapping);
        let numbers: Vec<usize> = applied.iter().map(|s| s.citation_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        // Every marker surviving the rewrite resolves within the applied list.
        let rewritten = rewrite_citations("see [3] and [5]", &mapping);
        for n in extract_citation_numbers(&rewritten) {
            assert!(applied.iter().any(|s| s.citation_number == n));
        }
    }

    #[test]
    fn numbered_context_format() {
        let ctx = build_numbered_context(&[source(1, "alpha"), source(2, "beta")]);
        assert!(ctx.contains("[1] (doc1.pdf, page 1):\nalpha"));
        assert!(ctx.contains("[2] (doc2.pdf, page 1):\nbeta"));
    }

    #[test]
    fn score_array_parsing() {
        assert_eq!(
            parse_score_array("[8, 3, 9.5]", 3),
            Some(vec![8.0, 3.0, 9.5])
        );
        assert_eq!(
            parse_score_array("Here you go: [8, 3] done", 2),
            Some(vec![8.0, 3.0])
        );
        assert_eq!(parse_score_array("[8, 3]", 3), None);
        assert_eq!(parse_score_array("no array", 1), None);
        assert_eq!(parse_score_array("[\"a\"]", 1), None);
    }

    #[test]
    fn token_estimate_and_clipping() {
        assert_eq!(approx_token_count(""), 0);
        assert_eq!(approx_token_count("abcd"), 1);
        assert_eq!(approx_token_count("abcde"), 2);

        let text = "x".repeat(100);
        let clipped = clip_to_tokens(&text, 10);
        assert_eq!(clipped.len(), 40);
        assert_eq!(clip_to_tokens("short", 10), "short");
    }
}
