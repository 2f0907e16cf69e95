//! Foundation-model providers for the research engine.
//!
//! One trait, four implementations: OpenAI, Anthropic, Google and a local
//! OpenAI-compatible server (which also backs source preprocessing).  The
//! provider is chosen at config time with a per-request override.

mod anthropic;
mod google;
mod http;
mod local;
mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use local::LocalProvider;
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{AppConfig, LlmProviderKind};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Overrides the provider's default model when set.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> LlmProviderKind;

    fn default_model(&self) -> &str;

    /// Approximate input-token budget available for packed context.
    fn context_budget_tokens(&self) -> usize;

    async fn generate(&self, request: &ChatRequest) -> AppResult<ChatResponse>;
}

/// Build a provider from config.  API keys come from the provider-standard
/// environment variables; missing keys fail fast at startup.
pub fn build_provider(
    kind: LlmProviderKind,
    config: &AppConfig,
) -> AppResult<Arc<dyn LlmProvider>> {
    let model = config.llm_model.clone();
    match kind {
        LlmProviderKind::OpenAi => {
            let api_key = require_env("OPENAI_API_KEY")?;
            Ok(Arc::new(OpenAiProvider::new(api_key, model, config.llm_timeout_s)?))
        }
        LlmProviderKind::Anthropic => {
            let api_key = require_env("ANTHROPIC_API_KEY")?;
            Ok(Arc::new(AnthropicProvider::new(api_key, model, config.llm_timeout_s)?))
        }
        LlmProviderKind::Google => {
            let api_key = require_env("GOOGLE_API_KEY")?;
            Ok(Arc::new(GoogleProvider::new(api_key, model, config.llm_timeout_s)?))
        }
        LlmProviderKind::Local => Ok(Arc::new(LocalProvider::new(
            std::env::var("DOCSEARCH_LOCAL_LLM_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            model,
            config.llm_timeout_s,
        )?)),
    }
}

fn require_env(key: &str) -> AppResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidInput(format!("{} is not set", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors() {
        let m = ChatMessage::system("rules");
        assert_eq!(m.role, Role::System);
        assert_eq!(m.content, "rules");
        let m = ChatMessage::user("question");
        assert_eq!(m.role, Role::User);
    }
}
