//! OpenAI chat-completions provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::HttpLlmClient;
use super::{ChatRequest, ChatResponse, LlmProvider, Role};
use crate::config::LlmProviderKind;
use crate::error::{AppError, AppResult};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiProvider {
    client: HttpLlmClient,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<String>, timeout_s: u64) -> AppResult<Self> {
        Ok(Self {
            client: HttpLlmClient::new(timeout_s)?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

pub(super) fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> LlmProviderKind {
        LlmProviderKind::OpenAi
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn context_budget_tokens(&self) -> usize {
        16_000
    }

    async fn generate(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = OpenAiRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: role_name(m.role),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let response: OpenAiResponse = self
            .client
            .post_json(&format!("{}/v1/chat/completions", BASE_URL), &body, &headers)
            .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Dependency("provider returned no choices".into()))?;

        Ok(ChatResponse { text, model: response.model })
    }
}
