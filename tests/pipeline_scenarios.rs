//! End-to-end pipeline scenarios against in-process fakes.

use async_trait::async_trait;
use ops_copilot::actions::{ActionApi, ActionDesk, DispatchReceipt};
use ops_copilot::agent::LOW_CONFIDENCE_CAVEAT;
use ops_copilot::composer::{ComposeEvent, NO_EVIDENCE_TEXT};
use ops_copilot::audit::{AuditPayload, AuditStore, InMemoryAuditStore};
use ops_copilot::error::FailureKind;
use ops_copilot::generation::{
    ExtractiveGenerator, GenerationOptions, GenerationService, Prompt, TokenStream,
};
use ops_copilot::retrieval::{HashingEmbedder, IndexHit, SimilarityIndex};
use ops_copilot::session::SessionRegistry;
use ops_copilot::{
    ActionRequest, ActionState, Chunk, ChunkMetadata, Copilot, CopilotConfig, Intent,
    OrchestrationError, PipelineOutcome, Query, Result, Stage,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

//
// ================= Fakes =================
//

struct FixedIndex(Vec<IndexHit>);

#[async_trait]
impl SimilarityIndex for FixedIndex {
    async fn search(&self, _embedding: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        Ok(self.0.iter().take(k).cloned().collect())
    }
}

struct DownIndex;

#[async_trait]
impl SimilarityIndex for DownIndex {
    async fn search(&self, _embedding: &[f32], _k: usize) -> Result<Vec<IndexHit>> {
        Err(OrchestrationError::RetrievalUnavailable(
            "connection refused".to_string(),
        ))
    }
}

/// Fails the first `failures` calls, then answers extractively.
struct FlakyGenerator {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl GenerationService for FlakyGenerator {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TokenStream> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(OrchestrationError::GenerationUnavailable("503".to_string()));
        }
        ExtractiveGenerator::new().stream(prompt, options).await
    }
}

/// Always answers with the same text.
struct ScriptedGenerator(&'static str);

#[async_trait]
impl GenerationService for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(&self, _prompt: &Prompt, _options: &GenerationOptions) -> Result<TokenStream> {
        let fragments: Vec<Result<String>> = self
            .0
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}

/// Returns the next draft on every call, repeating the last one.
struct DraftSequence {
    drafts: Vec<&'static str>,
    calls: AtomicU32,
}

#[async_trait]
impl GenerationService for DraftSequence {
    fn name(&self) -> &'static str {
        "draft-sequence"
    }

    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TokenStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let draft = self.drafts[call.min(self.drafts.len() - 1)];
        ScriptedGenerator(draft).stream(prompt, options).await
    }
}

/// Never produces a token.
struct StalledGenerator;

#[async_trait]
impl GenerationService for StalledGenerator {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn stream(&self, _prompt: &Prompt, _options: &GenerationOptions) -> Result<TokenStream> {
        Ok(Box::pin(futures::stream::pending()))
    }
}

struct CountingApi(AtomicU32);

#[async_trait]
impl ActionApi for CountingApi {
    async fn dispatch(&self, _request: &ActionRequest) -> Result<DispatchReceipt> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(DispatchReceipt {
            status: 200,
            message: "Paused item".to_string(),
            body: serde_json::json!({"status": "ok"}),
        })
    }
}

//
// ================= Fixtures =================
//

fn chunk(id: &str, text: &str) -> Arc<Chunk> {
    Arc::new(Chunk {
        chunk_id: id.to_string(),
        document_id: "onboarding_guide".to_string(),
        text: text.to_string(),
        metadata: ChunkMetadata {
            source: "onboarding_guide.pdf".to_string(),
            filename: "onboarding_guide.pdf".to_string(),
            page: Some(1),
            ..Default::default()
        },
    })
}

fn onboarding_hits() -> Vec<IndexHit> {
    vec![
        IndexHit {
            chunk: chunk(
                "onboarding_p1_c0",
                "New stores must upload a signed merchant agreement before activation. Legal reviews it within two days.",
            ),
            score: 0.91,
        },
        IndexHit {
            chunk: chunk(
                "onboarding_p1_c1",
                "Every store needs a verified bank account for weekly payouts. Verification uses a test deposit.",
            ),
            score: 0.84,
        },
        IndexHit {
            chunk: chunk(
                "onboarding_p2_c0",
                "Menus are imported from the point of sale system during onboarding. Missing prices block publishing.",
            ),
            score: 0.77,
        },
    ]
}

struct Harness {
    copilot: Arc<Copilot>,
    audit: Arc<InMemoryAuditStore>,
    api: Arc<CountingApi>,
}

fn harness(index: Arc<dyn SimilarityIndex>, generator: Arc<dyn GenerationService>) -> Harness {
    let mut config = CopilotConfig::default();
    config.generation.retry_backoff = Duration::from_millis(5);

    let audit = Arc::new(InMemoryAuditStore::new());
    let api = Arc::new(CountingApi(AtomicU32::new(0)));
    let sessions = SessionRegistry::new();
    let desk = Arc::new(ActionDesk::new(
        api.clone(),
        audit.clone(),
        sessions.clone(),
    ));

    let copilot = Copilot::assemble(
        config,
        index,
        Arc::new(HashingEmbedder::default()),
        generator,
        desk,
        audit.clone(),
        sessions,
        3,
    )
    .expect("assemble copilot");

    Harness {
        copilot: Arc::new(copilot),
        audit,
        api,
    }
}

/// What a live-typing client ends up showing after replaying every event.
fn replay(rx: &mut UnboundedReceiver<ComposeEvent>) -> String {
    let mut shown = String::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ComposeEvent::Fragment(text) => shown.push_str(&text),
            ComposeEvent::Restart => shown.clear(),
            ComposeEvent::Replace(text) => shown = text,
        }
    }
    shown
}

//
// ================= Scenarios =================
//

#[tokio::test]
async fn test_onboarding_question_is_answered_with_citations() {
    let h = harness(
        Arc::new(FixedIndex(onboarding_hits())),
        Arc::new(ExtractiveGenerator::new()),
    );

    let query = Query::new("What is the onboarding checklist for new stores?");
    let query_id = query.query_id;
    let result = h.copilot.ask(query).await.unwrap();

    assert_eq!(result.intent, Intent::Knowledge);
    let PipelineOutcome::Knowledge(knowledge) = &result.outcome else {
        panic!("expected a knowledge outcome, got {:?}", result.outcome);
    };

    assert_eq!(knowledge.retrieved.len(), 3);
    assert!(!knowledge.response.citations.is_empty());
    assert!(knowledge.critique.passed());
    assert!(!knowledge.low_confidence);
    assert!(!knowledge.recomposed);

    let retrieved_ids: Vec<&str> = knowledge.retrieved.iter().map(|c| c.id()).collect();
    for citation in &knowledge.response.citations {
        assert!(retrieved_ids.contains(&citation.chunk_id.as_str()));
        assert!(!knowledge.response.span_text(citation).is_empty());
    }

    let stages: Vec<Stage> = result.decision_log.iter().map(|e| e.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Router, Stage::Retriever, Stage::Composer, Stage::Critic]
    );

    let persisted = h.audit.for_query(query_id).await.unwrap();
    assert_eq!(persisted.len(), result.decision_log.len());
    assert!(persisted.iter().all(|r| r.verify_integrity()));
}

#[tokio::test]
async fn test_pause_command_prepares_pending_request() {
    let h = harness(
        Arc::new(FixedIndex(onboarding_hits())),
        Arc::new(ExtractiveGenerator::new()),
    );

    let result = h
        .copilot
        .ask(Query::new("pause 'daily backup process'").with_requester("ops_lead"))
        .await
        .unwrap();

    assert_eq!(result.intent, Intent::Action);
    let PipelineOutcome::Action(action) = &result.outcome else {
        panic!("expected an action outcome, got {:?}", result.outcome);
    };
    assert_eq!(action.request.state, ActionState::Pending);
    assert_eq!(action.request.target.as_deref(), Some("daily backup process"));
    assert_eq!(action.request.requester, "ops_lead");

    let pending = h.copilot.desk().pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(h.api.0.load(Ordering::SeqCst), 0);

    let done = h
        .copilot
        .desk()
        .approve_and_dispatch(action.request.request_id, "reviewer")
        .await
        .unwrap();
    assert_eq!(done.state, ActionState::Dispatched);
    assert_eq!(h.api.0.load(Ordering::SeqCst), 1);

    let transitions = h
        .audit
        .for_query(result.query_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| matches!(r.payload, AuditPayload::Transition(_)))
        .count();
    assert_eq!(transitions, 3);
}

#[tokio::test]
async fn test_unsupported_command_halts_without_request() {
    let h = harness(
        Arc::new(FixedIndex(onboarding_hits())),
        Arc::new(ExtractiveGenerator::new()),
    );

    let result = h.copilot.ask(Query::new("delete all records")).await.unwrap();

    assert_eq!(result.intent, Intent::Action);
    let PipelineOutcome::Halted(halt) = &result.outcome else {
        panic!("expected a halted outcome, got {:?}", result.outcome);
    };
    assert_eq!(halt.kind, FailureKind::UnsupportedAction);
    assert!(halt.message.contains("delete"));
    assert!(h.copilot.desk().pending().await.is_empty());
    assert!(result
        .decision_log
        .iter()
        .any(|e| e.stage == Stage::ActionParser && e.output_summary.starts_with("rejected")));
}

#[tokio::test]
async fn test_empty_index_answers_no_evidence() {
    let h = harness(Arc::new(FixedIndex(Vec::new())), Arc::new(StalledGenerator));

    let result = h
        .copilot
        .ask(Query::new("What is the refund policy for damaged goods?"))
        .await
        .unwrap();

    let PipelineOutcome::Knowledge(knowledge) = &result.outcome else {
        panic!("expected a knowledge outcome, got {:?}", result.outcome);
    };
    assert!(knowledge.response.no_evidence);
    assert!(knowledge.response.citations.is_empty());
    assert!(knowledge.critique.passed());
    assert!(!knowledge.low_confidence);
}

#[tokio::test]
async fn test_retrieval_outage_halts() {
    let h = harness(Arc::new(DownIndex), Arc::new(ExtractiveGenerator::new()));

    let result = h
        .copilot
        .ask(Query::new("How are payouts scheduled?"))
        .await
        .unwrap();

    let PipelineOutcome::Halted(halt) = &result.outcome else {
        panic!("expected a halted outcome, got {:?}", result.outcome);
    };
    assert_eq!(halt.kind, FailureKind::RetrievalUnavailable);
    assert!(!result.decision_log.is_empty());
}

#[tokio::test]
async fn test_generation_is_retried_once() {
    let generator = Arc::new(FlakyGenerator {
        failures: 1,
        calls: AtomicU32::new(0),
    });
    let h = harness(Arc::new(FixedIndex(onboarding_hits())), generator.clone());

    let result = h
        .copilot
        .ask(Query::new("What is the onboarding checklist for new stores?"))
        .await
        .unwrap();

    assert!(matches!(result.outcome, PipelineOutcome::Knowledge(_)));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_generation_outage_halts_after_retry() {
    let generator = Arc::new(FlakyGenerator {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let h = harness(Arc::new(FixedIndex(onboarding_hits())), generator.clone());

    let result = h
        .copilot
        .ask(Query::new("What is the onboarding checklist for new stores?"))
        .await
        .unwrap();

    let PipelineOutcome::Halted(halt) = &result.outcome else {
        panic!("expected a halted outcome, got {:?}", result.outcome);
    };
    assert_eq!(halt.kind, FailureKind::GenerationUnavailable);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unsupported_citations_get_caveat() {
    let h = harness(
        Arc::new(FixedIndex(onboarding_hits())),
        Arc::new(ScriptedGenerator(
            "Stores are activated automatically after signup [pricing_p9_c4].",
        )),
    );

    let result = h
        .copilot
        .ask(Query::new("What is the onboarding checklist for new stores?"))
        .await
        .unwrap();

    let PipelineOutcome::Knowledge(knowledge) = &result.outcome else {
        panic!("expected a knowledge outcome, got {:?}", result.outcome);
    };
    assert!(knowledge.recomposed);
    assert!(knowledge.low_confidence);
    assert!(!knowledge.critique.passed());
    assert!(knowledge.response.text.ends_with(LOW_CONFIDENCE_CAVEAT));
    assert_eq!(
        knowledge.response.dropped_citations,
        vec!["pricing_p9_c4".to_string()]
    );
}

#[tokio::test]
async fn test_newer_query_cancels_running_pipeline() {
    let h = harness(
        Arc::new(FixedIndex(onboarding_hits())),
        Arc::new(StalledGenerator),
    );
    let session = Uuid::new_v4();

    let first = Query::new("What is the onboarding checklist for new stores?").with_session(session);
    let first_id = first.query_id;
    let copilot = Arc::clone(&h.copilot);
    let running = tokio::spawn(async move { copilot.ask(first).await });

    while h.copilot.sessions().running() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let second = h
        .copilot
        .ask(Query::new("pause 'daily backup process'").with_session(session))
        .await
        .unwrap();
    assert!(matches!(second.outcome, PipelineOutcome::Action(_)));

    let first_result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("cancelled pipeline should finish")
        .unwrap();
    assert!(matches!(first_result, Err(OrchestrationError::Cancelled(_))));

    let first_log = h.audit.for_query(first_id).await.unwrap();
    assert!(first_log.iter().any(|r| matches!(
        &r.payload,
        AuditPayload::Decision(entry) if entry.stage == Stage::Orchestrator
    )));
}

#[tokio::test]
async fn test_retrieval_order_is_repeatable() {
    let h = harness(
        Arc::new(FixedIndex(onboarding_hits())),
        Arc::new(ExtractiveGenerator::new()),
    );

    let mut orders = Vec::new();
    for _ in 0..3 {
        let result = h
            .copilot
            .ask(Query::new("What is the onboarding checklist for new stores?"))
            .await
            .unwrap();
        let PipelineOutcome::Knowledge(knowledge) = result.outcome else {
            panic!("expected a knowledge outcome");
        };
        let ids: Vec<String> = knowledge.retrieved.iter().map(|c| c.id().to_string()).collect();
        orders.push(ids);
    }
    assert!(orders.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_streamed_no_evidence_answer_is_shown() {
    let h = harness(Arc::new(FixedIndex(Vec::new())), Arc::new(StalledGenerator));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let result = h
        .copilot
        .ask_streaming(Query::new("What is the refund policy for damaged goods?"), tx)
        .await
        .unwrap();

    let PipelineOutcome::Knowledge(knowledge) = &result.outcome else {
        panic!("expected a knowledge outcome, got {:?}", result.outcome);
    };
    assert!(knowledge.response.no_evidence);
    assert_eq!(replay(&mut rx), NO_EVIDENCE_TEXT);
}

#[tokio::test]
async fn test_stream_ends_on_the_kept_draft() {
    let first = "New stores must upload a signed merchant agreement [onboarding_p1_c0]. Payouts are instant [ghost_p9_c9].";
    let generator = Arc::new(DraftSequence {
        drafts: vec![first, "Something unrelated entirely [ghost_p7_c7]."],
        calls: AtomicU32::new(0),
    });
    let h = harness(Arc::new(FixedIndex(onboarding_hits())), generator.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let result = h
        .copilot
        .ask_streaming(
            Query::new("What is the onboarding checklist for new stores?"),
            tx,
        )
        .await
        .unwrap();

    let PipelineOutcome::Knowledge(knowledge) = &result.outcome else {
        panic!("expected a knowledge outcome, got {:?}", result.outcome);
    };
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert!(knowledge.recomposed);
    assert!(knowledge.low_confidence);

    let shown = replay(&mut rx);
    assert!(shown.contains("signed merchant agreement"));
    assert!(!shown.contains("unrelated"));
    assert_eq!(knowledge.response.text, format!("{}{}", shown, LOW_CONFIDENCE_CAVEAT));
}
