use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Hard cap on uncompressed full-document markdown.
pub const MARKDOWN_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Metadata string values longer than this are truncated before they reach
/// the vector store.
pub const METADATA_STRING_CAP: usize = 8192;

/// Maximum allowed length for search queries and research questions (chars).
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Upper bound on `num_sources` for the research endpoint.
pub const MAX_RESEARCH_SOURCES: usize = 20;

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

/// Preferred compute device for the encoder and ASR stacks.
/// Falls back to CPU when the requested device is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Gpu,
    Cpu,
}

impl DevicePreference {
    fn from_env(key: &str, default: Self) -> Self {
        match env_var(key).as_deref() {
            Some("gpu") => DevicePreference::Gpu,
            Some("cpu") => DevicePreference::Cpu,
            _ => default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePreference::Gpu => "gpu",
            DevicePreference::Cpu => "cpu",
        }
    }
}

/// LLM provider selection for the research engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Local,
}

impl LlmProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" => Some(Self::Google),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Local => "local",
        }
    }
}

/// Preprocessing strategy applied to retrieved sources before the
/// foundation-model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessStrategy {
    Compress,
    Filter,
    Synthesize,
}

impl PreprocessStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compress" => Some(Self::Compress),
            "filter" => Some(Self::Filter),
            "synthesize" => Some(Self::Synthesize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compress => "compress",
            Self::Filter => "filter",
            Self::Synthesize => "synthesize",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub enabled: bool,
    pub model: String,
    pub language: String,
    pub device: DevicePreference,
    pub word_timestamps: bool,
    pub temperature: f32,
    pub max_time_chunk_s: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,

    // External collaborators
    pub parser_url: String,
    pub converter_url: String,
    pub encoder_url: String,
    pub vector_db_url: String,
    pub object_store_url: String,
    pub uploads_bucket: String,

    // Ingestion pool
    pub max_parallel_jobs: usize,
    pub queue_capacity: usize,
    pub job_timeout_s_per_page: u64,

    // Encoder
    pub batch_size_visual: usize,
    pub batch_size_text: usize,
    pub encoder_device: DevicePreference,

    // ASR
    pub asr: AsrConfig,

    // Sidecars
    pub markdown_compression_threshold_bytes: usize,
    pub structure_cache_size: usize,
    pub structure_compression: bool,
    pub structure_extraction_timeout_s: u64,
    pub structure_min_confidence: f64,
    pub bbox_coordinate_precision: u32,

    // LLM / research
    pub llm_provider: LlmProviderKind,
    pub llm_model: Option<String>,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub llm_timeout_s: u64,
    pub preprocess_enabled: bool,
    pub preprocess_strategy: PreprocessStrategy,
    pub preprocess_threshold: f64,
    pub preprocess_max_sources: usize,

    // Search
    pub search_candidates_k: usize,
    pub search_default_results: usize,
    pub hybrid_alpha: f32,

    // Timeouts
    pub parser_timeout_s: u64,
    pub doc_conversion_timeout_s: u64,
    pub vector_db_timeout_s: u64,
    pub ws_request_timeout_s: u64,

    pub enhanced_mode: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = env_var("DOCSEARCH_PORT").unwrap_or_else(|| "9820".to_string());

        let data_dir = env_var("DOCSEARCH_DATA_DIR").unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("docsearch-backend").to_string_lossy().to_string())
                .unwrap_or_else(|| ".docsearch-data".to_string())
        });

        let default_parallel = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).clamp(1, 2))
            .unwrap_or(1);

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            data_dir,

            parser_url: env_var("DOCSEARCH_PARSER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9821".to_string()),
            converter_url: env_var("DOCSEARCH_CONVERTER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9822".to_string()),
            encoder_url: env_var("DOCSEARCH_ENCODER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9823".to_string()),
            vector_db_url: env_var("DOCSEARCH_VECTOR_DB_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
            object_store_url: env_var("DOCSEARCH_OBJECT_STORE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9000".to_string()),
            uploads_bucket: env_var("DOCSEARCH_UPLOADS_BUCKET")
                .unwrap_or_else(|| "uploads".to_string()),

            max_parallel_jobs: env_parse("DOCSEARCH_MAX_PARALLEL_JOBS", default_parallel),
            queue_capacity: env_parse("DOCSEARCH_QUEUE_CAPACITY", 256),
            job_timeout_s_per_page: env_parse("DOCSEARCH_JOB_TIMEOUT_S_PER_PAGE", 300),

            batch_size_visual: env_parse("DOCSEARCH_BATCH_SIZE_VISUAL", 4),
            batch_size_text: env_parse("DOCSEARCH_BATCH_SIZE_TEXT", 32),
            encoder_device: DevicePreference::from_env(
                "DOCSEARCH_ENCODER_DEVICE",
                DevicePreference::Gpu,
            ),

            asr: AsrConfig {
                enabled: env_bool("DOCSEARCH_ASR_ENABLED", true),
                model: env_var("DOCSEARCH_ASR_MODEL").unwrap_or_else(|| "turbo".to_string()),
                language: env_var("DOCSEARCH_ASR_LANGUAGE").unwrap_or_else(|| "auto".to_string()),
                device: DevicePreference::from_env("DOCSEARCH_ASR_DEVICE", DevicePreference::Gpu),
                word_timestamps: env_bool("DOCSEARCH_ASR_WORD_TIMESTAMPS", false),
                temperature: env_parse::<f32>("DOCSEARCH_ASR_TEMPERATURE", 0.0).clamp(0.0, 1.0),
                max_time_chunk_s: env_parse("DOCSEARCH_ASR_MAX_TIME_CHUNK", 30.0),
            },

            markdown_compression_threshold_bytes: env_parse(
                "DOCSEARCH_MARKDOWN_COMPRESSION_THRESHOLD_BYTES",
                1024,
            ),
            structure_cache_size: env_parse("DOCSEARCH_STRUCTURE_CACHE_SIZE", 20).max(1),
            structure_compression: env_bool("DOCSEARCH_STRUCTURE_COMPRESSION", true),
            structure_extraction_timeout_s: env_parse("DOCSEARCH_STRUCTURE_EXTRACTION_TIMEOUT_S", 30),
            structure_min_confidence: env_parse::<f64>("DOCSEARCH_STRUCTURE_MIN_CONFIDENCE", 0.3)
                .clamp(0.0, 1.0),
            bbox_coordinate_precision: env_parse("DOCSEARCH_BBOX_COORDINATE_PRECISION", 2),

            llm_provider: env_var("DOCSEARCH_LLM_PROVIDER")
                .as_deref()
                .and_then(LlmProviderKind::parse)
                .unwrap_or(LlmProviderKind::OpenAi),
            llm_model: env_var("DOCSEARCH_LLM_MODEL"),
            llm_max_tokens: env_parse("DOCSEARCH_LLM_MAX_TOKENS", 2048),
            llm_temperature: env_parse::<f32>("DOCSEARCH_LLM_TEMPERATURE", 0.3).clamp(0.0, 2.0),
            llm_timeout_s: env_parse("DOCSEARCH_LLM_TIMEOUT_S", 60),
            preprocess_enabled: env_bool("DOCSEARCH_PREPROCESS_ENABLED", false),
            preprocess_strategy: env_var("DOCSEARCH_PREPROCESS_STRATEGY")
                .as_deref()
                .and_then(PreprocessStrategy::parse)
                .unwrap_or(PreprocessStrategy::Compress),
            preprocess_threshold: env_parse::<f64>("DOCSEARCH_PREPROCESS_THRESHOLD", 7.0)
                .clamp(0.0, 10.0),
            preprocess_max_sources: env_parse("DOCSEARCH_PREPROCESS_MAX_SOURCES", 10),

            search_candidates_k: env_parse("DOCSEARCH_SEARCH_CANDIDATES_K", 50),
            search_default_results: env_parse("DOCSEARCH_SEARCH_DEFAULT_RESULTS", 10),
            hybrid_alpha: env_parse::<f32>("DOCSEARCH_HYBRID_ALPHA", 0.5).clamp(0.0, 1.0),

            parser_timeout_s: env_parse("DOCSEARCH_PARSER_TIMEOUT_S", 30),
            doc_conversion_timeout_s: env_parse("DOCSEARCH_DOC_CONVERSION_TIMEOUT_S", 30).min(300),
            vector_db_timeout_s: env_parse("DOCSEARCH_VECTOR_DB_TIMEOUT_S", 30),
            ws_request_timeout_s: env_parse("DOCSEARCH_WS_REQUEST_TIMEOUT_S", 10),

            enhanced_mode: env_bool("DOCSEARCH_ENHANCED_MODE", true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_preference_parsing() {
        assert_eq!(DevicePreference::Gpu.as_str(), "gpu");
        assert_eq!(DevicePreference::Cpu.as_str(), "cpu");
    }

    #[test]
    fn llm_provider_parsing() {
        assert_eq!(LlmProviderKind::parse("openai"), Some(LlmProviderKind::OpenAi));
        assert_eq!(LlmProviderKind::parse("anthropic"), Some(LlmProviderKind::Anthropic));
        assert_eq!(LlmProviderKind::parse("google"), Some(LlmProviderKind::Google));
        assert_eq!(LlmProviderKind::parse("local"), Some(LlmProviderKind::Local));
        assert_eq!(LlmProviderKind::parse("mistral"), None);
    }

    #[test]
    fn preprocess_strategy_parsing() {
        assert_eq!(PreprocessStrategy::parse("compress"), Some(PreprocessStrategy::Compress));
        assert_eq!(PreprocessStrategy::parse("filter"), Some(PreprocessStrategy::Filter));
        assert_eq!(PreprocessStrategy::parse("synthesize"), Some(PreprocessStrategy::Synthesize));
        assert_eq!(PreprocessStrategy::parse(""), None);
    }

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::from_env();
        assert!(config.max_parallel_jobs >= 1);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.markdown_compression_threshold_bytes, 1024);
        assert!(config.hybrid_alpha >= 0.0 && config.hybrid_alpha <= 1.0);
        assert!(config.structure_cache_size >= 1);
        assert!(config.doc_conversion_timeout_s <= 300);
    }
}
