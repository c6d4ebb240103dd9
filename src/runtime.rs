//! Process runtime
//!
//! Owns everything that outlives a single query: the index, the session
//! registry, the approval desk and the audit store. Created once at
//! startup with `Copilot::init` and torn down with `Copilot::shutdown`.

use crate::actions::{ActionApi, ActionDesk, OpsApiClient};
use crate::agent::{Orchestrator, PipelineSettings};
use crate::audit::{build_audit_store, AuditStore};
use crate::composer::{ComposeEvent, Composer};
use crate::config::CopilotConfig;
use crate::critic::create_default_critic;
use crate::generation::{ExtractiveGenerator, GenerationService, GroqClient};
use crate::models::{OrchestrationResult, Query};
use crate::retrieval::{load_corpus, Embedder, HashingEmbedder, InMemoryIndex, Retriever};
use crate::router::{IntentClassifier, LlmIntentClassifier, Router};
use crate::session::SessionRegistry;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

pub struct Copilot {
    config: CopilotConfig,
    orchestrator: Orchestrator,
    desk: Arc<ActionDesk>,
    audit: Arc<dyn AuditStore>,
    sessions: SessionRegistry,
    generator: Arc<dyn GenerationService>,
    indexed_chunks: usize,
}

impl Copilot {
    /// Wire up every component from configuration.
    ///
    /// A missing corpus leaves the index empty rather than failing, so
    /// every knowledge query answers "no evidence".
    pub async fn init(config: CopilotConfig) -> Result<Self> {
        let embedder = Arc::new(HashingEmbedder::default());

        let chunks = match load_corpus(&config.corpus_path).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(
                    path = %config.corpus_path.display(),
                    error = %e,
                    "Corpus not loaded; starting with an empty index"
                );
                Vec::new()
            }
        };
        let index = InMemoryIndex::from_chunks(chunks, embedder.as_ref()).await?;
        let indexed_chunks = index.len().await;

        let generator: Arc<dyn GenerationService> = match &config.generation.api_key {
            Some(key) => Arc::new(GroqClient::new(
                key.clone(),
                config.generation.base_url.clone(),
                config.generation.model.clone(),
            )?),
            None => {
                warn!("GROQ_API_KEY not set; using the offline extractive generator");
                Arc::new(ExtractiveGenerator::new())
            }
        };

        let audit = build_audit_store(&config).await?;
        let sessions = SessionRegistry::new();
        let api: Arc<dyn ActionApi> =
            Arc::new(OpsApiClient::new(&config.ops_api_url, &config.operator_name)?);
        let desk = Arc::new(ActionDesk::new(api, Arc::clone(&audit), sessions.clone()));

        Self::assemble(
            config,
            Arc::new(index),
            embedder,
            generator,
            desk,
            audit,
            sessions,
            indexed_chunks,
        )
    }

    /// Build from pre-made parts. Used by tests and embedders of the library.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        config: CopilotConfig,
        index: Arc<dyn crate::retrieval::SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn GenerationService>,
        desk: Arc<ActionDesk>,
        audit: Arc<dyn AuditStore>,
        sessions: SessionRegistry,
        indexed_chunks: usize,
    ) -> Result<Self> {
        // the offline generator cannot classify, so it gets no fallback
        let classifier: Option<Arc<dyn IntentClassifier>> = match config.generation.api_key {
            Some(_) => Some(Arc::new(LlmIntentClassifier::new(Arc::clone(&generator)))),
            None => None,
        };

        let orchestrator = Orchestrator::new(
            Router::new(classifier),
            Retriever::new(index, embedder, &config.retrieval),
            Composer::new(
                Arc::clone(&generator),
                config.generation.retry_backoff,
                config.generation.max_tokens,
            ),
            create_default_critic(&config.critique),
            Arc::clone(&desk),
            Arc::clone(&audit),
            sessions.clone(),
            PipelineSettings::from_config(&config),
        );

        info!(
            chunks = indexed_chunks,
            generator = generator.name(),
            audit = audit.backend(),
            "Copilot initialized"
        );

        Ok(Self {
            config,
            orchestrator,
            desk,
            audit,
            sessions,
            generator,
            indexed_chunks,
        })
    }

    pub async fn ask(&self, query: Query) -> Result<OrchestrationResult> {
        self.orchestrator.run(query).await
    }

    pub async fn ask_streaming(
        &self,
        query: Query,
        progress: UnboundedSender<ComposeEvent>,
    ) -> Result<OrchestrationResult> {
        self.orchestrator.run_with_progress(query, Some(progress)).await
    }

    pub fn config(&self) -> &CopilotConfig {
        &self.config
    }

    pub fn desk(&self) -> &Arc<ActionDesk> {
        &self.desk
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    pub fn indexed_chunks(&self) -> usize {
        self.indexed_chunks
    }

    /// Cancel in-flight pipelines, then flush and close the audit store.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Copilot shutting down");
        self.sessions.cancel_all();
        self.audit.flush().await?;
        self.audit.close().await
    }
}
