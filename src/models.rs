//! Core data models for the query pipeline

use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    #[default]
    Detailed,
    Concise,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Knowledge,
    Action,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionVerb {
    Pause,
    Unpause,
    UpdateHours,
}

/// Lifecycle of an action request.
///
/// `pending → approved → dispatched | failed`, or `pending → rejected`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Pending,
    Approved,
    Rejected,
    Dispatched,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Router,
    Retriever,
    Composer,
    Critic,
    ActionParser,
    Orchestrator,
}

//
// ================= Query =================
//

/// Per-query overrides; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub query_id: Uuid,
    pub session_id: Uuid,
    pub requester: String,
    pub text: String,
    pub options: QueryOptions,
    pub received_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            requester: "anonymous".to_string(),
            text: text.into(),
            options: QueryOptions::default(),
            received_at: Utc::now(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

//
// ================= Chunks =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub chunk: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
}

/// A bounded span of source-document text. Owned by the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Human-readable source label, e.g. `onboarding.pdf p2`.
    pub fn label(&self) -> String {
        let name = if self.metadata.filename.is_empty() {
            self.document_id.as_str()
        } else {
            self.metadata.filename.as_str()
        };
        match self.metadata.page {
            Some(page) => format!("{} p{}", name, page),
            None => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Arc<Chunk>,
    pub score: f32,
    /// 1-based position after filtering.
    pub rank: usize,
}

impl RetrievedChunk {
    pub fn id(&self) -> &str {
        &self.chunk.chunk_id
    }
}

//
// ================= Composition =================
//

/// Links the byte span `[span_start, span_end)` of the response text to a chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub chunk_id: String,
    pub span_start: usize,
    pub span_end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedResponse {
    pub text: String,
    pub citations: Vec<Citation>,
    pub style: Style,
    /// Set when no evidence was available and the generator was not consulted.
    pub no_evidence: bool,
    /// Marker ids that referenced chunks outside the retrieved set.
    #[serde(default)]
    pub dropped_citations: Vec<String>,
}

impl ComposedResponse {
    /// The text a citation claims support for. Empty if the span is out of range.
    pub fn span_text(&self, citation: &Citation) -> &str {
        self.text
            .get(citation.span_start..citation.span_end)
            .unwrap_or_default()
    }
}

//
// ================= Critique =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedReason {
    NotRetrieved,
    LowOverlap,
    DroppedByComposer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsupportedCitation {
    pub chunk_id: String,
    pub reason: UnsupportedReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingCheck {
    pub rule_name: String,
    pub chunk_id: String,
    pub passed: bool,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueResult {
    /// Always within `[0, 1]`.
    pub grounding_score: f32,
    pub threshold: f32,
    pub unsupported: Vec<UnsupportedCitation>,
    pub checks: Vec<GroundingCheck>,
    pub verdict: Verdict,
    pub critiqued_at: DateTime<Utc>,
}

impl CritiqueResult {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

//
// ================= Actions =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionTransition {
    pub request_id: Uuid,
    pub query_id: Uuid,
    pub session_id: Uuid,
    /// `None` for the creation record.
    pub from: Option<ActionState>,
    pub to: ActionState,
    pub actor: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Also serves as the idempotency key toward the action API.
    pub request_id: Uuid,
    pub query_id: Uuid,
    pub session_id: Uuid,
    pub verb: ActionVerb,
    pub target: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub state: ActionState,
    pub requester: String,
    pub original_query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<ActionTransition>,
}

//
// ================= Decision Log =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionLogEntry {
    pub query_id: Uuid,
    pub session_id: Uuid,
    pub sequence: u32,
    pub stage: Stage,
    pub input_summary: String,
    pub output_summary: String,
    pub at: DateTime<Utc>,
}

const SUMMARY_MAX_CHARS: usize = 160;

/// Append-only decision log scoped to one query.
#[derive(Debug, Clone)]
pub struct DecisionLog {
    query_id: Uuid,
    session_id: Uuid,
    entries: Vec<DecisionLogEntry>,
}

impl DecisionLog {
    pub fn new(query: &Query) -> Self {
        Self {
            query_id: query.query_id,
            session_id: query.session_id,
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: Stage, input: impl AsRef<str>, output: impl AsRef<str>) {
        let entry = DecisionLogEntry {
            query_id: self.query_id,
            session_id: self.session_id,
            sequence: self.entries.len() as u32,
            stage,
            input_summary: summarize(input.as_ref(), SUMMARY_MAX_CHARS),
            output_summary: summarize(output.as_ref(), SUMMARY_MAX_CHARS),
            at: Utc::now(),
        };
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DecisionLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<DecisionLogEntry> {
        self.entries
    }
}

/// Collapse whitespace and cap length on a char boundary.
pub(crate) fn summarize(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars).collect();
    out.push('…');
    out
}

//
// ================= Pipeline Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeResult {
    pub response: ComposedResponse,
    pub critique: CritiqueResult,
    pub retrieved: Vec<RetrievedChunk>,
    pub low_confidence: bool,
    pub recomposed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub request: ActionRequest,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaltReason {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Knowledge(KnowledgeResult),
    Action(ActionResult),
    Halted(HaltReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationResult {
    pub query_id: Uuid,
    pub session_id: Uuid,
    pub intent: Intent,
    pub outcome: PipelineOutcome,
    pub decision_log: Vec<DecisionLogEntry>,
    pub execution_time_ms: u64,
}

//
// ================= Display / Parsing =================
//

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Style::Detailed => "detailed",
            Style::Concise => "concise",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Style {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "detailed" => Ok(Style::Detailed),
            "concise" => Ok(Style::Concise),
            other => Err(format!("unknown style '{}'", other)),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::Knowledge => "knowledge",
            Intent::Action => "action",
        };
        write!(f, "{}", s)
    }
}

impl ActionVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionVerb::Pause => "pause",
            ActionVerb::Unpause => "unpause",
            ActionVerb::UpdateHours => "update_hours",
        }
    }
}

impl fmt::Display for ActionVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionState::Pending => "pending",
            ActionState::Approved => "approved",
            ActionState::Rejected => "rejected",
            ActionState::Dispatched => "dispatched",
            ActionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Router => "router",
            Stage::Retriever => "retriever",
            Stage::Composer => "composer",
            Stage::Critic => "critic",
            Stage::ActionParser => "action_parser",
            Stage::Orchestrator => "orchestrator",
        };
        write!(f, "{}", s)
    }
}
