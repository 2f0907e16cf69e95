//! Vector store client.
//!
//! Two logical collections — `visual` (one multi-vector per rasterised page)
//! and `text` (one per chunk) — live in a remote ANN database reached over
//! HTTP.  The backend only ever sees the mean-pooled form of each
//! multi-vector; the full matrix travels as a compressed sidecar inside the
//! embedding's metadata so late-interaction rescoring can run caller-side.
//!
//! The metadata boundary is strict: flat maps of primitives only.  Nested
//! maps are flattened with `.`-joined paths, lists are stringified, nulls
//! dropped and overlong strings truncated to [`METADATA_STRING_CAP`].

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{AppConfig, METADATA_STRING_CAP};
use crate::encoder::MultiVector;
use crate::error::{AppError, AppResult};
use crate::sidecar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Visual,
    Text,
}

impl Collection {
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Visual => "visual",
            Collection::Text => "text",
        }
    }

    pub const ALL: [Collection; 2] = [Collection::Visual, Collection::Text];
}

/// Metadata keys used for the embedded multi-vector sidecar.
const MULTIVEC_KEY: &str = "multivec";
const MULTIVEC_DIM_KEY: &str = "multivec_dim";

/// One ANN candidate returned by `query`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub embedding_id: String,
    pub distance: f32,
    pub metadata: Map<String, Value>,
}

impl Candidate {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    /// Recover the full multi-vector from the compressed sidecar fields.
    pub fn multivector(&self) -> AppResult<Option<MultiVector>> {
        let Some(blob) = self.str_field(MULTIVEC_KEY) else {
            return Ok(None);
        };
        let dim = self
            .metadata
            .get(MULTIVEC_DIM_KEY)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                AppError::Corrupted(format!("{} missing multivec_dim", self.embedding_id))
            })? as usize;
        MultiVector::from_compressed_b64(blob, dim).map(Some)
    }
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    ids: Vec<String>,
    #[serde(default)]
    metadatas: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Vec<Vec<f32>>,
    #[serde(default)]
    metadatas: Vec<Vec<Map<String, Value>>>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    ids: Vec<String>,
}

pub struct VectorStoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl VectorStoreClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.vector_db_timeout_s))
            .build()
            .map_err(|e| AppError::Dependency(format!("failed to build vector-db client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.vector_db_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, collection: Collection, op: &str) -> String {
        format!("{}/collections/{}/{}", self.base_url, collection.name(), op)
    }

    async fn post(&self, url: &str, body: &Value) -> AppResult<reqwest::Response> {
        let resp = self.http.post(url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "vector db returned {}: {}",
                status, text
            )));
        }
        Ok(resp)
    }

    pub async fn heartbeat(&self) -> bool {
        self.http
            .get(format!("{}/heartbeat", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Store one embedding.  The ANN vector is the mean-pooled form; the full
    /// multi-vector is folded into the metadata as a compressed sidecar.
    pub async fn add(
        &self,
        collection: Collection,
        embedding_id: &str,
        multivec: &MultiVector,
        metadata: &Value,
    ) -> AppResult<()> {
        let mut sanitized = sanitize_metadata(metadata);
        sanitized.insert(
            MULTIVEC_KEY.to_string(),
            Value::String(multivec.to_compressed_b64()?),
        );
        sanitized.insert(MULTIVEC_DIM_KEY.to_string(), json!(multivec.dim));

        let body = json!({
            "ids": [embedding_id],
            "embeddings": [multivec.mean_pooled()],
            "metadatas": [sanitized],
        });
        self.post(&self.collection_url(collection, "add"), &body)
            .await?;
        debug!(collection = collection.name(), embedding_id, "stored embedding");
        Ok(())
    }

    /// Fetch one embedding by id; decompresses the multi-vector on read.
    pub async fn get(
        &self,
        collection: Collection,
        embedding_id: &str,
    ) -> AppResult<Option<(Option<MultiVector>, Map<String, Value>)>> {
        let body = json!({ "ids": [embedding_id], "include": ["metadatas"] });
        let resp: GetResponse = self
            .post(&self.collection_url(collection, "get"), &body)
            .await?
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad vector-db response: {}", e)))?;

        let Some(idx) = resp.ids.iter().position(|id| id == embedding_id) else {
            return Ok(None);
        };
        let metadata = resp.metadatas.get(idx).cloned().unwrap_or_default();
        let candidate = Candidate {
            embedding_id: embedding_id.to_string(),
            distance: 0.0,
            metadata,
        };
        let multivec = match candidate.multivector() {
            Ok(mv) => mv,
            Err(e) => {
                error!(embedding_id, error = %e, "corrupted multivector sidecar");
                return Err(e);
            }
        };
        Ok(Some((multivec, candidate.metadata)))
    }

    /// Fetch metadata records matching a flat equality filter.
    pub async fn get_where(
        &self,
        collection: Collection,
        where_filter: &Value,
        limit: usize,
    ) -> AppResult<Vec<Candidate>> {
        let body = json!({
            "where": where_filter,
            "limit": limit,
            "include": ["metadatas"],
        });
        let resp: GetResponse = self
            .post(&self.collection_url(collection, "get"), &body)
            .await?
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad vector-db response: {}", e)))?;

        Ok(resp
            .ids
            .into_iter()
            .zip(resp.metadatas)
            .map(|(id, metadata)| Candidate {
                embedding_id: id,
                distance: 0.0,
                metadata,
            })
            .collect())
    }

    /// ANN query on the pooled representation.  Returns candidates with
    /// metadata included so the caller can rescore without extra round-trips.
    pub async fn query(
        &self,
        collection: Collection,
        pooled_query: &[f32],
        top_k: usize,
        where_filter: Option<&Value>,
    ) -> AppResult<Vec<Candidate>> {
        let mut body = json!({
            "query_embeddings": [pooled_query],
            "n_results": top_k,
            "include": ["metadatas", "distances"],
        });
        if let Some(w) = where_filter {
            body["where"] = w.clone();
        }
        let resp: QueryResponse = self
            .post(&self.collection_url(collection, "query"), &body)
            .await?
            .json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad vector-db response: {}", e)))?;

        let ids = resp.ids.into_iter().next().unwrap_or_default();
        let distances = resp.distances.into_iter().next().unwrap_or_default();
        let metadatas = resp.metadatas.into_iter().next().unwrap_or_default();

        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| Candidate {
                embedding_id: id,
                distance: distances.get(i).copied().unwrap_or(0.0),
                metadata: metadatas.get(i).cloned().unwrap_or_default(),
            })
            .collect())
    }

    /// Delete every embedding belonging to a document, in both collections.
    /// Returns (visual, text) deletion counts.
    pub async fn delete_by_doc(&self, doc_id: &str) -> AppResult<(usize, usize)> {
        let mut counts = [0usize; 2];
        for (i, collection) in Collection::ALL.iter().enumerate() {
            let body = json!({ "where": { "doc_id": doc_id } });
            let resp: DeleteResponse = self
                .post(&self.collection_url(*collection, "delete"), &body)
                .await?
                .json()
                .await
                .map_err(|e| AppError::Dependency(format!("bad vector-db response: {}", e)))?;
            counts[i] = resp.ids.len();
        }
        Ok((counts[0], counts[1]))
    }

    /// Does any embedding exist for this document?
    pub async fn document_exists(&self, doc_id: &str) -> AppResult<bool> {
        for collection in Collection::ALL {
            if !self
                .get_where(collection, &json!({ "doc_id": doc_id }), 1)
                .await?
                .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Document-level metadata, read from whichever collection holds the
    /// document.  Sidecar fields are stripped from the returned record.
    pub async fn get_document_metadata(&self, doc_id: &str) -> AppResult<Option<Map<String, Value>>> {
        self.find_document(&json!({ "doc_id": doc_id })).await
    }

    /// Document-level metadata looked up by original filename.  Used where
    /// no content exists yet to derive an id from (registration, presign).
    pub async fn find_document_by_filename(
        &self,
        filename: &str,
    ) -> AppResult<Option<Map<String, Value>>> {
        self.find_document(&json!({ "filename": filename })).await
    }

    /// Resolve which document an object key was ingested as.
    pub async fn find_doc_id_by_source_key(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self
            .find_document(&json!({ "source_key": key }))
            .await?
            .and_then(|m| m.get("doc_id").and_then(|v| v.as_str()).map(String::from)))
    }

    async fn find_document(&self, filter: &Value) -> AppResult<Option<Map<String, Value>>> {
        for collection in Collection::ALL {
            let mut found = self.get_where(collection, filter, 1).await?;
            if let Some(candidate) = found.pop() {
                let mut metadata = candidate.metadata;
                metadata.remove(MULTIVEC_KEY);
                metadata.remove(MULTIVEC_DIM_KEY);
                metadata.remove(sidecar::STRUCTURE_COMPRESSED_KEY);
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    /// Full-document markdown, decompressed.  `None` when the document has
    /// no markdown.  A corrupted blob is non-blocking: it is logged with the
    /// document id and treated as absent (the other collection may still
    /// hold an intact copy).
    pub async fn get_document_markdown(&self, doc_id: &str) -> AppResult<Option<String>> {
        for collection in Collection::ALL {
            let mut found = self
                .get_where(collection, &json!({ "doc_id": doc_id }), 1)
                .await?;
            let Some(candidate) = found.pop() else { continue };

            let compression = candidate
                .str_field(sidecar::MARKDOWN_COMPRESSION_KEY)
                .unwrap_or(sidecar::COMPRESSION_NONE);
            let value = match compression {
                sidecar::COMPRESSION_GZIP_B64 => {
                    candidate.str_field(sidecar::MARKDOWN_COMPRESSED_KEY)
                }
                _ => candidate.str_field(sidecar::MARKDOWN_INLINE_KEY),
            };
            let Some(value) = value else { continue };

            match sidecar::decode_markdown(compression, value) {
                Ok(markdown) => return Ok(Some(markdown)),
                Err(e) => {
                    error!(
                        doc_id,
                        collection = collection.name(),
                        error = %e,
                        "corrupted markdown sidecar"
                    );
                    continue;
                }
            }
        }
        Ok(None)
    }
}

/// Flatten arbitrary JSON into the flat primitive map the store accepts.
pub fn sanitize_metadata(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                flatten_into(&mut out, key.clone(), v);
            }
        }
        other => {
            warn!("non-object metadata payload sanitised to empty map: {}", other);
        }
    }
    out
}

fn flatten_into(out: &mut Map<String, Value>, path: String, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(_) | Value::Number(_) => {
            out.insert(path, value.clone());
        }
        Value::String(s) => {
            out.insert(path, Value::String(truncate_chars(s, METADATA_STRING_CAP)));
        }
        Value::Array(items) => {
            let rendered = serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string());
            out.insert(path, Value::String(truncate_chars(&rendered, METADATA_STRING_CAP)));
        }
        Value::Object(map) => {
            for (key, v) in map {
                flatten_into(out, format!("{}.{}", path, key), v);
            }
        }
    }
}

/// Byte-capped truncation that never splits a UTF-8 sequence.
fn truncate_chars(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_flattens_nested_maps() {
        let metadata = json!({
            "doc_id": "abc",
            "audio": { "id3": { "artist": "Holst" }, "bitrate_kbps": 320 },
            "page": 3,
        });
        let flat = sanitize_metadata(&metadata);
        assert_eq!(flat.get("doc_id").unwrap(), "abc");
        assert_eq!(flat.get("audio.id3.artist").unwrap(), "Holst");
        assert_eq!(flat.get("audio.bitrate_kbps").unwrap(), 320);
        assert_eq!(flat.get("page").unwrap(), 3);
    }

    #[test]
    fn sanitize_stringifies_lists_and_drops_nulls() {
        let metadata = json!({
            "tags": ["a", "b"],
            "missing": null,
            "ok": true,
        });
        let flat = sanitize_metadata(&metadata);
        assert_eq!(flat.get("tags").unwrap(), "[\"a\",\"b\"]");
        assert!(!flat.contains_key("missing"));
        assert_eq!(flat.get("ok").unwrap(), true);
    }

    #[test]
    fn sanitize_truncates_overlong_strings() {
        let long = "x".repeat(METADATA_STRING_CAP + 100);
        let flat = sanitize_metadata(&json!({ "text": long }));
        assert_eq!(flat.get("text").unwrap().as_str().unwrap().len(), METADATA_STRING_CAP);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Each 'é' is two bytes; a naive byte slice at an odd cap would panic.
        let s = "é".repeat(10);
        let truncated = truncate_chars(&s, 7);
        assert!(truncated.len() <= 7);
        assert!(s.starts_with(&truncated));
    }

    #[test]
    fn candidate_multivector_roundtrip() {
        let mv = MultiVector::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let mut metadata = Map::new();
        metadata.insert(
            MULTIVEC_KEY.to_string(),
            Value::String(mv.to_compressed_b64().unwrap()),
        );
        metadata.insert(MULTIVEC_DIM_KEY.to_string(), json!(2));
        let candidate = Candidate {
            embedding_id: "text_chunk_abc_0".into(),
            distance: 0.1,
            metadata,
        };
        assert_eq!(candidate.multivector().unwrap().unwrap(), mv);
    }

    #[test]
    fn candidate_without_sidecar_yields_none() {
        let candidate = Candidate {
            embedding_id: "x".into(),
            distance: 0.0,
            metadata: Map::new(),
        };
        assert!(candidate.multivector().unwrap().is_none());
    }
}
