//! Encoder facade.
//!
//! Uniform interface over the remote visual-text encoder (ColPali-family,
//! multi-vector per page) and the text encoder (multi-vector per chunk).
//! The facade owns everything the encoder service does not: device
//! negotiation with CPU fallback, batch sizing, the serialisation lock (the
//! accelerator cannot host two batches at once), and the single half-batch
//! retry after an out-of-memory response.  Identical input under identical
//! (device, precision) settings yields identical output; ordering is
//! preserved across batches.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, DevicePreference};
use crate::error::{AppError, AppResult};

/// A late-interaction embedding: a row-major `(tokens, dim)` matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiVector {
    pub dim: usize,
    pub data: Vec<f32>,
}

impl MultiVector {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> AppResult<Self> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        if dim == 0 {
            return Err(AppError::Encoder("empty embedding returned".into()));
        }
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in &rows {
            if row.len() != dim {
                return Err(AppError::Encoder("ragged embedding rows".into()));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { dim, data })
    }

    pub fn tokens(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Mean over the token axis.  This pooled form is what the vector DB's
    /// ANN index sees; full late-interaction scoring uses the whole matrix.
    pub fn mean_pooled(&self) -> Vec<f32> {
        let tokens = self.tokens();
        if tokens == 0 {
            return vec![0.0; self.dim];
        }
        let mut pooled = vec![0.0f32; self.dim];
        for t in 0..tokens {
            let row = self.row(t);
            for (acc, v) in pooled.iter_mut().zip(row) {
                *acc += v;
            }
        }
        let n = tokens as f32;
        for v in &mut pooled {
            *v /= n;
        }
        pooled
    }

    /// Serialise to gzip+base64 little-endian f32 bytes for sidecar storage.
    pub fn to_compressed_b64(&self) -> AppResult<String> {
        let mut bytes = Vec::with_capacity(self.data.len() * 4);
        for v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        crate::sidecar::compress_to_b64(&bytes)
    }

    pub fn from_compressed_b64(blob: &str, dim: usize) -> AppResult<Self> {
        let bytes = crate::sidecar::decompress_from_b64(blob)?;
        if dim == 0 || bytes.len() % 4 != 0 || (bytes.len() / 4) % dim != 0 {
            return Err(AppError::Corrupted(format!(
                "multivector blob has invalid length {} for dim {}",
                bytes.len(),
                dim
            )));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { dim, data })
    }
}

#[derive(Debug, Deserialize)]
struct CapabilitiesResponse {
    devices: Vec<String>,
    #[allow(dead_code)]
    dim: usize,
}

#[derive(Debug, Serialize)]
struct EncodeRequest<'a> {
    inputs: Vec<&'a str>,
    device: &'a str,
}

#[derive(Debug, Deserialize)]
struct EncodeResponse {
    embeddings: Vec<EmbeddingWire>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingWire {
    dim: usize,
    data: Vec<f32>,
}

pub struct EncoderClient {
    http: reqwest::Client,
    base_url: String,
    device: DevicePreference,
    batch_size_visual: usize,
    batch_size_text: usize,
    /// The accelerator hosts one batch at a time; concurrent jobs queue here.
    lock: tokio::sync::Mutex<()>,
}

impl EncoderClient {
    /// Connect and negotiate the device.  A GPU request against a CPU-only
    /// encoder downgrades with a single warning.
    pub async fn connect(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AppError::Encoder(format!("failed to build encoder client: {}", e)))?;

        let base_url = config.encoder_url.trim_end_matches('/').to_string();

        let device = match http
            .get(format!("{}/capabilities", base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => {
                let caps: CapabilitiesResponse = resp.json().await.map_err(|e| {
                    AppError::Encoder(format!("bad capabilities response: {}", e))
                })?;
                let gpu_available = caps
                    .devices
                    .iter()
                    .any(|d| matches!(d.as_str(), "gpu" | "cuda" | "mps"));
                match (config.encoder_device, gpu_available) {
                    (DevicePreference::Gpu, true) => DevicePreference::Gpu,
                    (DevicePreference::Gpu, false) => {
                        warn!("encoder service has no accelerated device, falling back to cpu");
                        DevicePreference::Cpu
                    }
                    (DevicePreference::Cpu, _) => DevicePreference::Cpu,
                }
            }
            Err(e) => {
                // Encoder may come up after us; keep the preference and let
                // the first encode call surface unavailability.
                warn!("encoder capabilities probe failed ({}), deferring device check", e);
                config.encoder_device
            }
        };

        info!(device = device.as_str(), "encoder facade ready");

        Ok(Self {
            http,
            base_url,
            device,
            batch_size_visual: config.batch_size_visual.max(1),
            batch_size_text: config.batch_size_text.max(1),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Embed rasterised page images (PNG bytes), in input order.
    /// The cancel token is observed between batches, never inside one.
    pub async fn embed_pages(
        &self,
        images: &[Vec<u8>],
        cancel: &CancellationToken,
    ) -> AppResult<Vec<MultiVector>> {
        let encoded: Vec<String> = images.iter().map(|png| B64.encode(png)).collect();
        let refs: Vec<&str> = encoded.iter().map(|s| s.as_str()).collect();
        self.run_batches("embed/visual", &refs, self.batch_size_visual, cancel)
            .await
    }

    /// Embed chunk texts, in input order.
    pub async fn embed_chunks(
        &self,
        texts: &[&str],
        cancel: &CancellationToken,
    ) -> AppResult<Vec<MultiVector>> {
        self.run_batches("embed/text", texts, self.batch_size_text, cancel)
            .await
    }

    /// Embed a search query.
    pub async fn embed_query(&self, query: &str) -> AppResult<MultiVector> {
        let token = CancellationToken::new();
        let mut result = self.run_batches("embed/query", &[query], 1, &token).await?;
        result
            .pop()
            .ok_or_else(|| AppError::Encoder("encoder returned no query embedding".into()))
    }

    async fn run_batches(
        &self,
        endpoint: &str,
        inputs: &[&str],
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<MultiVector>> {
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let _guard = self.lock.lock().await;
            match self.encode_once(endpoint, batch).await {
                Ok(vecs) => out.extend(vecs),
                Err(e) if is_oom(&e) && batch.len() > 1 => {
                    // One retry at half batch, then give up.
                    warn!(
                        endpoint,
                        batch = batch.len(),
                        "encoder OOM, retrying at half batch"
                    );
                    let mid = batch.len() / 2;
                    out.extend(self.encode_once(endpoint, &batch[..mid]).await?);
                    out.extend(self.encode_once(endpoint, &batch[mid..]).await?);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn encode_once(&self, endpoint: &str, inputs: &[&str]) -> AppResult<Vec<MultiVector>> {
        let request = EncodeRequest {
            inputs: inputs.to_vec(),
            device: self.device.as_str(),
        };
        let resp = self
            .http
            .post(format!("{}/{}", self.base_url, endpoint))
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::INSUFFICIENT_STORAGE {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Encoder(format!("out of memory: {}", body)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(AppError::Dependency(format!(
                    "encoder returned {}: {}",
                    status, body
                )));
            }
            return Err(AppError::Encoder(format!(
                "encoder returned {}: {}",
                status, body
            )));
        }

        let parsed: EncodeResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Encoder(format!("bad encoder response: {}", e)))?;

        if parsed.embeddings.len() != inputs.len() {
            return Err(AppError::Encoder(format!(
                "encoder returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                inputs.len()
            )));
        }

        parsed
            .embeddings
            .into_iter()
            .map(|w| {
                if w.dim == 0 || w.data.is_empty() || w.data.len() % w.dim != 0 {
                    Err(AppError::Encoder("malformed embedding payload".into()))
                } else {
                    Ok(MultiVector { dim: w.dim, data: w.data })
                }
            })
            .collect()
    }
}

fn is_oom(e: &AppError) -> bool {
    matches!(e, AppError::Encoder(msg) if msg.contains("out of memory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(rows: &[&[f32]]) -> MultiVector {
        MultiVector::from_rows(rows.iter().map(|r| r.to_vec()).collect()).unwrap()
    }

    #[test]
    fn mean_pooling() {
        let m = mv(&[&[1.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]]);
        assert_eq!(m.tokens(), 3);
        let pooled = m.mean_pooled();
        assert!((pooled[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((pooled[1] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn ragged_rows_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(MultiVector::from_rows(rows).is_err());
        assert!(MultiVector::from_rows(vec![]).is_err());
    }

    #[test]
    fn compressed_roundtrip() {
        let m = mv(&[&[0.25, -1.5, 3.0], &[1e-7, 42.0, -0.0]]);
        let blob = m.to_compressed_b64().unwrap();
        let back = MultiVector::from_compressed_b64(&blob, 3).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn compressed_blob_dim_mismatch_rejected() {
        let m = mv(&[&[1.0, 2.0]]);
        let blob = m.to_compressed_b64().unwrap();
        assert!(matches!(
            MultiVector::from_compressed_b64(&blob, 3),
            Err(AppError::Corrupted(_))
        ));
        assert!(matches!(
            MultiVector::from_compressed_b64(&blob, 0),
            Err(AppError::Corrupted(_))
        ));
    }

    #[test]
    fn oom_detection() {
        assert!(is_oom(&AppError::Encoder("out of memory: cuda".into())));
        assert!(!is_oom(&AppError::Encoder("bad payload".into())));
        assert!(!is_oom(&AppError::Dependency("down".into())));
    }
}
