use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use crate::assets::AssetStore;
use crate::config::{AppConfig, LlmProviderKind};
use crate::delete::DeleteCoordinator;
use crate::encoder::EncoderClient;
use crate::error::AppResult;
use crate::jobs::JobQueue;
use crate::llm::{self, LlmProvider};
use crate::object_store::ObjectStoreClient;
use crate::parser::ParserClient;
use crate::processor::Processor;
use crate::registry::Registry;
use crate::research::ResearchEngine;
use crate::search::SearchEngine;
use crate::structure::StructureService;
use crate::vector_store::VectorStoreClient;

/// ISO-8601 UTC timestamp carried by every server→client message.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Events broadcast to all connected WebSocket clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ProcessingUpdate {
        doc_id: String,
        filename: String,
        status: String,
        stage: String,
        progress: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: String,
    },
    ProcessingComplete {
        doc_id: String,
        filename: String,
        chunks: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        pages: Option<usize>,
        file_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail_url: Option<String>,
        timestamp: String,
    },
    ProcessingError {
        doc_id: String,
        filename: String,
        stage: String,
        error: String,
        timestamp: String,
    },
    Stats {
        active: usize,
        completed: usize,
        failed: usize,
        total: usize,
        timestamp: String,
    },
    Log {
        level: String,
        message: String,
        timestamp: String,
    },
    UploadBatchRegistered {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        registrations: Vec<crate::registry::UploadRegistration>,
        timestamp: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<VectorStoreClient>,
    pub assets: Arc<AssetStore>,
    pub structure: Arc<StructureService>,
    pub search: Arc<SearchEngine>,
    pub research: Arc<ResearchEngine>,
    pub registry: Arc<Registry>,
    pub queue: Arc<JobQueue>,
    pub delete: Arc<DeleteCoordinator>,
    pub object_store: Arc<ObjectStoreClient>,
    pub event_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let (event_tx, _) = broadcast::channel(1024);

        let data_dir = std::path::PathBuf::from(&config.data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let store = Arc::new(VectorStoreClient::new(&config)?);
        let assets = Arc::new(AssetStore::new(&data_dir)?);
        let structure = Arc::new(StructureService::new(store.clone(), config.structure_cache_size));
        let encoder = Arc::new(EncoderClient::connect(&config).await?);
        let parser = Arc::new(ParserClient::new(&config)?);
        let object_store = Arc::new(ObjectStoreClient::new(&config)?);

        let search = Arc::new(SearchEngine::new(encoder.clone(), store.clone(), &config));

        // Build every provider whose credentials are present; the configured
        // default is required, the rest are per-request override targets.
        let mut providers: HashMap<LlmProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        for kind in [
            LlmProviderKind::OpenAi,
            LlmProviderKind::Anthropic,
            LlmProviderKind::Google,
            LlmProviderKind::Local,
        ] {
            match llm::build_provider(kind, &config) {
                Ok(provider) => {
                    providers.insert(kind, provider);
                }
                Err(e) if kind == config.llm_provider => return Err(e),
                Err(e) => {
                    warn!(provider = kind.as_str(), error = %e, "provider unavailable");
                }
            }
        }
        let local = providers.get(&LlmProviderKind::Local).cloned();

        let research = Arc::new(ResearchEngine::new(
            search.clone(),
            store.clone(),
            providers,
            local,
            &config,
        ));

        let processor = Arc::new(Processor::new(
            parser.clone(),
            encoder.clone(),
            store.clone(),
            assets.clone(),
            structure.clone(),
            event_tx.clone(),
            &config,
        ));

        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        crate::jobs::spawn_workers(
            queue.clone(),
            processor,
            event_tx.clone(),
            config.max_parallel_jobs,
            config.job_timeout_s_per_page,
        );

        let registry = Arc::new(Registry::new(store.clone(), queue.clone()));
        let delete = Arc::new(DeleteCoordinator::new(
            store.clone(),
            assets.clone(),
            structure.clone(),
            object_store.clone(),
        ));

        Ok(Self {
            config,
            store,
            assets,
            structure,
            search,
            research,
            registry,
            queue,
            delete,
            object_store,
            event_tx,
        })
    }
}
