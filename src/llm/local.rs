//! Local accelerated-inference provider.
//!
//! Speaks the OpenAI-compatible chat API most local servers expose.  Besides
//! acting as a foundation-model fallback, this is the model that runs source
//! preprocessing (compress / filter / synthesize).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::HttpLlmClient;
use super::openai::role_name;
use super::{ChatRequest, ChatResponse, LlmProvider};
use crate::config::LlmProviderKind;
use crate::error::{AppError, AppResult};

const DEFAULT_MODEL: &str = "local";

#[derive(Debug, Serialize)]
struct LocalMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct LocalRequest<'a> {
    model: &'a str,
    messages: Vec<LocalMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct LocalResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<LocalChoice>,
}

#[derive(Debug, Deserialize)]
struct LocalChoice {
    message: LocalChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct LocalChoiceMessage {
    content: Option<String>,
}

pub struct LocalProvider {
    client: HttpLlmClient,
    base_url: String,
    model: String,
}

impl LocalProvider {
    pub fn new(base_url: String, model: Option<String>, timeout_s: u64) -> AppResult<Self> {
        Ok(Self {
            client: HttpLlmClient::new(timeout_s)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn kind(&self) -> LlmProviderKind {
        LlmProviderKind::Local
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn context_budget_tokens(&self) -> usize {
        4_000
    }

    async fn generate(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = LocalRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| LocalMessage {
                    role: role_name(m.role),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let response: LocalResponse = self
            .client
            .post_json(&format!("{}/v1/chat/completions", self.base_url), &body, &[])
            .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Dependency("local model returned no choices".into()))?;

        Ok(ChatResponse {
            text,
            model: response.model.unwrap_or_else(|| model.to_string()),
        })
    }
}
