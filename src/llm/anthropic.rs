//! Anthropic messages provider.
//!
//! Anthropic takes the system prompt as a top-level field rather than a
//! message, so the system message is extracted before conversion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::HttpLlmClient;
use super::{ChatRequest, ChatResponse, LlmProvider, Role};
use crate::config::LlmProviderKind;
use crate::error::{AppError, AppResult};

const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicProvider {
    client: HttpLlmClient,
    api_key: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: Option<String>, timeout_s: u64) -> AppResult<Self> {
        Ok(Self {
            client: HttpLlmClient::new(timeout_s)?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> LlmProviderKind {
        LlmProviderKind::Anthropic
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn context_budget_tokens(&self) -> usize {
        30_000
    }

    async fn generate(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str());

        let messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                content: &m.content,
            })
            .collect();

        if messages.is_empty() {
            return Err(AppError::InvalidInput("no messages to send".into()));
        }

        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = AnthropicRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            system,
            temperature: request.temperature,
        };
        let headers = [
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", API_VERSION.to_string()),
        ];
        let response: AnthropicResponse = self
            .client
            .post_json(&format!("{}/v1/messages", BASE_URL), &body, &headers)
            .await?;

        let text = response
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(AppError::Dependency("provider returned no text blocks".into()));
        }

        Ok(ChatResponse { text, model: response.model })
    }
}
