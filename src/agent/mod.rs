//! Query orchestrator
//!
//! INPUT → ROUTE → (RETRIEVE → COMPOSE → CRITIQUE → RECOMPOSE?) | PARSE ACTION → COMPLETE
//!
//! One pipeline instance per query; stages run strictly in sequence. Every
//! stage appends to the query's decision log, and the log is written to the
//! audit store before the result is returned.

use crate::actions::{ActionDesk, ActionParser};
use crate::audit::AuditStore;
use crate::composer::{ComposeEvent, ComposeOptions, Composer};
use crate::config::{CopilotConfig, GroundingPolicy};
use crate::critic::Critic;
use crate::error::OrchestrationError;
use crate::models::{
    ActionResult, ComposedResponse, CritiqueResult, DecisionLog, HaltReason, Intent,
    KnowledgeResult, OrchestrationResult, PipelineOutcome, Query, RetrievedChunk, Stage, Style,
};
use crate::retrieval::Retriever;
use crate::router::Router;
use crate::session::{PipelineGuard, SessionRegistry};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

pub const LOW_CONFIDENCE_CAVEAT: &str = "\n\nNote: low confidence. Parts of this answer could not be verified against the retrieved sources; check the cited documents before acting on it.";

/// Per-process pipeline defaults. Query options override them.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_k: usize,
    pub default_style: Style,
    pub default_temperature: f32,
    pub grounding_policy: GroundingPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &CopilotConfig) -> Self {
        Self {
            default_k: config.retrieval.default_k,
            default_style: config.generation.style,
            default_temperature: config.generation.temperature,
            grounding_policy: config.critique.policy,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&CopilotConfig::default())
    }
}

pub struct Orchestrator {
    router: Router,
    retriever: Retriever,
    composer: Composer,
    critic: Critic,
    parser: ActionParser,
    desk: Arc<ActionDesk>,
    audit: Arc<dyn AuditStore>,
    sessions: SessionRegistry,
    settings: PipelineSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Router,
        retriever: Retriever,
        composer: Composer,
        critic: Critic,
        desk: Arc<ActionDesk>,
        audit: Arc<dyn AuditStore>,
        sessions: SessionRegistry,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            router,
            retriever,
            composer,
            critic,
            parser: ActionParser::new(),
            desk,
            audit,
            sessions,
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn run(&self, query: Query) -> Result<OrchestrationResult> {
        self.run_with_progress(query, None).await
    }

    /// Run one query. Stage failures come back as a `Halted` outcome; only
    /// a superseded (cancelled) pipeline returns `Err`.
    pub async fn run_with_progress(
        &self,
        query: Query,
        progress: Option<UnboundedSender<ComposeEvent>>,
    ) -> Result<OrchestrationResult> {
        let start_time = Instant::now();
        let guard = self.sessions.begin(&query);
        let mut log = DecisionLog::new(&query);

        info!(
            query_id = %query.query_id,
            session_id = %query.session_id,
            requester = %query.requester,
            "Orchestrator: query received"
        );

        let intent = self.router.classify(&query, &mut log).await;

        let outcome = match intent {
            Intent::Knowledge => self.answer(&query, &guard, progress, &mut log).await,
            Intent::Action => self.prepare_action(&query, &guard, &mut log).await,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(OrchestrationError::Cancelled(reason)) => {
                log.record(Stage::Orchestrator, "cancelled", &reason);
                self.persist(&log).await;
                info!(query_id = %query.query_id, reason = %reason, "Pipeline superseded");
                return Err(OrchestrationError::Cancelled(reason));
            }
            Err(e) => {
                log.record(
                    Stage::Orchestrator,
                    format!("halted: {:?}", e.kind()),
                    e.to_string(),
                );
                if e.is_service_failure() {
                    error!(query_id = %query.query_id, error = %e, "Pipeline halted");
                } else {
                    warn!(query_id = %query.query_id, error = %e, "Pipeline halted");
                }
                PipelineOutcome::Halted(HaltReason {
                    kind: e.kind(),
                    message: e.user_message(),
                })
            }
        };

        self.persist(&log).await;

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        info!(
            query_id = %query.query_id,
            intent = %intent,
            execution_time_ms,
            "Orchestrator: query complete"
        );

        Ok(OrchestrationResult {
            query_id: query.query_id,
            session_id: query.session_id,
            intent,
            outcome,
            decision_log: log.into_entries(),
            execution_time_ms,
        })
    }

    //
    // ================= Knowledge Path =================
    //

    async fn answer(
        &self,
        query: &Query,
        guard: &PipelineGuard,
        progress: Option<UnboundedSender<ComposeEvent>>,
        log: &mut DecisionLog,
    ) -> Result<PipelineOutcome> {
        let k = query.options.top_k.unwrap_or(self.settings.default_k);
        let chunks = match self.retriever.retrieve(query, k).await {
            Ok(chunks) => {
                log.record(Stage::Retriever, format!("k={}", k), describe_chunks(&chunks));
                chunks
            }
            Err(e) => {
                log.record(Stage::Retriever, format!("k={}", k), format!("error: {}", e));
                return Err(e);
            }
        };

        let style = query.options.style.unwrap_or(self.settings.default_style);
        let options = ComposeOptions {
            temperature: query
                .options
                .temperature
                .unwrap_or(self.settings.default_temperature),
            cancel: guard.token(),
            progress,
            strict: false,
            flagged: Vec::new(),
        };

        let response = self.compose(query, &chunks, style, &options, log).await?;
        let critique = self.critique(&response, &chunks, log);

        let (mut response, critique, recomposed) = if critique.passed()
            || response.no_evidence
            || self.settings.grounding_policy != GroundingPolicy::Recompose
        {
            (response, critique, false)
        } else {
            self.recompose(query, &chunks, style, options, response, critique, log)
                .await?
        };

        let low_confidence = !critique.passed();
        if low_confidence {
            let failure = OrchestrationError::GroundingFailure(format!(
                "score {:.2} below {:.2} or {} unsupported citation(s)",
                critique.grounding_score,
                critique.threshold,
                critique.unsupported.len()
            ));
            log.record(Stage::Orchestrator, "grounding", format!("{}; caveat appended", failure));
            response.text.push_str(LOW_CONFIDENCE_CAVEAT);
        }

        Ok(PipelineOutcome::Knowledge(KnowledgeResult {
            response,
            critique,
            retrieved: chunks,
            low_confidence,
            recomposed,
        }))
    }

    async fn compose(
        &self,
        query: &Query,
        chunks: &[RetrievedChunk],
        style: Style,
        options: &ComposeOptions,
        log: &mut DecisionLog,
    ) -> Result<ComposedResponse> {
        let input = format!(
            "{} chunk(s), style={}{}",
            chunks.len(),
            style,
            if options.strict { ", strict" } else { "" }
        );

        match self.composer.compose_with(query, chunks, style, options).await {
            Ok(response) => {
                log.record(
                    Stage::Composer,
                    input,
                    format!(
                        "{} citation(s), {} dropped{}",
                        response.citations.len(),
                        response.dropped_citations.len(),
                        if response.no_evidence { ", no evidence" } else { "" }
                    ),
                );
                Ok(response)
            }
            Err(e) => {
                log.record(Stage::Composer, input, format!("error: {}", e));
                Err(e)
            }
        }
    }

    fn critique(
        &self,
        response: &ComposedResponse,
        chunks: &[RetrievedChunk],
        log: &mut DecisionLog,
    ) -> CritiqueResult {
        let critique = self.critic.critique(response, chunks);
        log.record(
            Stage::Critic,
            format!("{} citation(s)", response.citations.len() + response.dropped_citations.len()),
            format!(
                "score={:.2} verdict={:?} unsupported={}",
                critique.grounding_score,
                critique.verdict,
                critique.unsupported.len()
            ),
        );
        critique
    }

    /// One bounded recompose attempt; keeps whichever draft grounds better.
    #[allow(clippy::too_many_arguments)]
    async fn recompose(
        &self,
        query: &Query,
        chunks: &[RetrievedChunk],
        style: Style,
        mut options: ComposeOptions,
        first: ComposedResponse,
        first_critique: CritiqueResult,
        log: &mut DecisionLog,
    ) -> Result<(ComposedResponse, CritiqueResult, bool)> {
        debug!(query_id = %query.query_id, "Critic rejected draft; recomposing once");

        options.strict = true;
        options.flagged = first_critique
            .unsupported
            .iter()
            .map(|u| u.chunk_id.clone())
            .collect();
        if let Some(tx) = &options.progress {
            let _ = tx.send(ComposeEvent::Restart);
        }

        let second = match self.compose(query, chunks, style, &options, log).await {
            Ok(second) => second,
            Err(OrchestrationError::Cancelled(reason)) => {
                return Err(OrchestrationError::Cancelled(reason));
            }
            Err(e) => {
                warn!(query_id = %query.query_id, error = %e, "Recompose failed; keeping first draft");
                show_kept_draft(&options, &first);
                return Ok((first, first_critique, false));
            }
        };
        let second_critique = self.critique(&second, chunks, log);

        let second_better = second_critique.passed()
            || (!first_critique.passed()
                && second_critique.grounding_score > first_critique.grounding_score);

        if second_better {
            Ok((second, second_critique, true))
        } else {
            show_kept_draft(&options, &first);
            Ok((first, first_critique, true))
        }
    }

    //
    // ================= Action Path =================
    //

    async fn prepare_action(
        &self,
        query: &Query,
        guard: &PipelineGuard,
        log: &mut DecisionLog,
    ) -> Result<PipelineOutcome> {
        let request = match self.parser.parse(query) {
            Ok(request) => {
                log.record(
                    Stage::ActionParser,
                    &query.text,
                    format!("{} -> pending ({})", request.describe(), request.request_id),
                );
                request
            }
            Err(e) => {
                log.record(Stage::ActionParser, &query.text, format!("rejected: {}", e));
                return Err(e);
            }
        };

        if guard.is_cancelled() {
            return Err(OrchestrationError::Cancelled(
                "superseded before the action request was recorded".to_string(),
            ));
        }

        self.desk.submit(request.clone()).await?;

        let message = format!(
            "Prepared action: {}. It is pending approval and has not been applied.",
            request.describe()
        );

        Ok(PipelineOutcome::Action(ActionResult { request, message }))
    }

    async fn persist(&self, log: &DecisionLog) {
        if let Err(e) = self.audit.record_decisions(log.entries()).await {
            error!(
                query_id = ?log.entries().first().map(|e| e.query_id),
                error = %e,
                backend = self.audit.backend(),
                "Failed to write decision log to audit store"
            );
        }
    }
}

fn describe_chunks(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return "0 chunks (no evidence)".to_string();
    }
    let ids: Vec<String> = chunks
        .iter()
        .map(|c| format!("{}@{:.2}", c.id(), c.score))
        .collect();
    format!("{} chunk(s): {}", chunks.len(), ids.join(", "))
}

/// The recompose draft was streamed; put the kept draft back on screen.
fn show_kept_draft(options: &ComposeOptions, kept: &ComposedResponse) {
    if let Some(tx) = &options.progress {
        let _ = tx.send(ComposeEvent::Replace(kept.text.clone()));
    }
}
