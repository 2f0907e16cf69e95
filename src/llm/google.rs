//! Google Gemini provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::HttpLlmClient;
use super::{ChatRequest, ChatResponse, LlmProvider, Role};
use crate::config::LlmProviderKind;
use crate::error::{AppError, AppResult};

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    candidates: Vec<GoogleCandidate>,
    #[serde(rename = "modelVersion", default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

pub struct GoogleProvider {
    client: HttpLlmClient,
    api_key: String,
    model: String,
}

impl GoogleProvider {
    pub fn new(api_key: String, model: Option<String>, timeout_s: u64) -> AppResult<Self> {
        Ok(Self {
            client: HttpLlmClient::new(timeout_s)?,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn kind(&self) -> LlmProviderKind {
        LlmProviderKind::Google
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn context_budget_tokens(&self) -> usize {
        16_000
    }

    async fn generate(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let system_instruction = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| SystemInstruction {
                parts: vec![Part { text: &m.content }],
            });

        let contents: Vec<Content> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| Content {
                role: match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                parts: vec![Part { text: &m.content }],
            })
            .collect();

        if contents.is_empty() {
            return Err(AppError::InvalidInput("no messages to send".into()));
        }

        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = GoogleRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        };
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            BASE_URL, model, self.api_key
        );
        let response: GoogleResponse = self.client.post_json(&url, &body, &[]).await?;

        let text = response
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(AppError::Dependency("provider returned no candidates".into()));
        }

        Ok(ChatResponse {
            text,
            model: response.model_version.unwrap_or_else(|| model.to_string()),
        })
    }
}
