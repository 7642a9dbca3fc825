//! Engine wiring.
//!
//! The process-global singletons of a typical service (settings, LLM
//! client, session maker) become one explicit `EngineContext` handed by
//! reference through the pipeline.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use crate::application::use_cases::drg_resolver::DrgResolver;
use crate::application::use_cases::embedding_service::EmbeddingService;
use crate::application::use_cases::template_store::TemplateStore;
use crate::domain::error::Result;
use crate::infrastructure::config::Settings;
use crate::infrastructure::db::{self, DbConfig};
use crate::infrastructure::llm_clients::openai::OpenAiClient;
use crate::infrastructure::llm_clients::LlmClient;

/// Shared services for the lifetime of the engine.
pub struct EngineContext {
    pub settings: Settings,
    pub pool: PgPool,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<EmbeddingService>,
    pub template_store: Arc<TemplateStore>,
    pub drg_resolver: Arc<DrgResolver>,
}

impl EngineContext {
    /// Connect the pool and construct every shared service.
    pub async fn initialize(settings: Settings) -> Result<Self> {
        let pool = db::init_pool(&settings.database_url, &DbConfig::default()).await?;

        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
            &settings.llm_base_url,
            &settings.llm_api_key,
        ));

        let embedder = Arc::new(EmbeddingService::new(
            Arc::clone(&llm),
            settings.embed_model.clone(),
            settings.embed_dimension,
        ));

        let template_store = Arc::new(TemplateStore::new(
            pool.clone(),
            Arc::clone(&embedder),
            settings.similarity_floor,
        ));

        let drg_resolver = Arc::new(DrgResolver::new(
            pool.clone(),
            Arc::clone(&embedder),
            settings.drg_similarity_floor,
        ));

        info!(
            chat_model = %settings.chat_model,
            embed_model = %settings.embed_model,
            embed_dimension = settings.embed_dimension,
            "Engine context initialized"
        );

        Ok(Self {
            settings,
            pool,
            llm,
            embedder,
            template_store,
            drg_resolver,
        })
    }
}
