//! Object store client.
//!
//! The store front end is an external collaborator; this client only deletes
//! source objects during document removal and proxies the store's presign
//! helpers for S3-style uploads.

use serde_json::{Value, json};
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::ids;

pub struct ObjectStoreClient {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
}

impl ObjectStoreClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Dependency(format!("failed to build object-store client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.object_store_url.trim_end_matches('/').to_string(),
            bucket: config.uploads_bucket.clone(),
        })
    }

    pub async fn delete_object(&self, key: &str) -> AppResult<()> {
        if !ids::validate_object_key(key) {
            return Err(AppError::AccessDenied(format!("invalid object key '{}'", key)));
        }
        let resp = self
            .http
            .delete(format!("{}/{}/{}", self.base_url, self.bucket, key))
            .send()
            .await?;
        let status = resp.status();
        // Absent objects are fine; the goal is "not there afterwards".
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "object store returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    pub async fn presign_upload(
        &self,
        filename: &str,
        content_type: &str,
        size: u64,
    ) -> AppResult<Value> {
        let body = json!({
            "bucket": self.bucket,
            "key": filename,
            "contentType": content_type,
            "size": size,
        });
        self.presign("upload", &body).await
    }

    pub async fn presign_get(&self, bucket: &str, key: &str) -> AppResult<Value> {
        if !ids::validate_object_key(key) {
            return Err(AppError::AccessDenied(format!("invalid object key '{}'", key)));
        }
        let body = json!({ "bucket": bucket, "key": key });
        self.presign("get", &body).await
    }

    async fn presign(&self, kind: &str, body: &Value) -> AppResult<Value> {
        let resp = self
            .http
            .post(format!("{}/presign/{}", self.base_url, kind))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::Dependency(format!(
                "object store returned {}: {}",
                status, text
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::Dependency(format!("bad presign response: {}", e)))
    }
}
