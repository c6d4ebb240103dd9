//! Composer stage
//!
//! Builds a grounded prompt from retrieved chunks, consumes the generation
//! stream and turns `[chunk_id]` markers into structured citations as the
//! text arrives.

use crate::error::OrchestrationError;
use crate::generation::{GenerationOptions, GenerationService, Prompt, PromptSource};
use crate::models::{Citation, ComposedResponse, Query, RetrievedChunk, Style};
use crate::Result;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One initial attempt plus a single retry.
const MAX_GENERATION_ATTEMPTS: u32 = 2;

/// Longest bracket body still treated as a possible marker while streaming.
const MAX_MARKER_LEN: usize = 128;

pub const NO_EVIDENCE_TEXT: &str = "No evidence found: the document corpus has no passages relevant to this question, so no answer was generated. Try rephrasing or ask about a documented procedure.";

const SYSTEM_PROMPT: &str = r#"You are an operations copilot for finance, menu, onboarding and platform workflows.

Guidelines:
- Answer ONLY from the provided context. If the context is insufficient, say you are unsure and state what is missing.
- Write clear, professional English for an operations audience.
- Open with a one-sentence summary, then give a numbered step-by-step procedure, then short notes for edge cases or policies when relevant.
- Cite sources inline with their identifier in square brackets, e.g. [doc-p1-c0], right where a claim is supported.
- Cite ONLY identifiers that appear in the context. Never invent identifiers.
- Return only the final answer."#;

/// Progress notifications for a live-typing UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposeEvent {
    Fragment(String),
    /// The previous attempt failed; discard fragments received so far.
    Restart,
    /// Discard fragments received so far and show this text instead.
    Replace(String),
}

#[derive(Debug, Clone)]
pub struct ComposeOptions {
    pub temperature: f32,
    pub cancel: CancellationToken,
    pub progress: Option<UnboundedSender<ComposeEvent>>,
    /// Tighten the citation instructions after a failed critique.
    pub strict: bool,
    /// Identifiers a previous draft cited without support.
    pub flagged: Vec<String>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            cancel: CancellationToken::new(),
            progress: None,
            strict: false,
            flagged: Vec::new(),
        }
    }
}

pub struct Composer {
    generator: Arc<dyn GenerationService>,
    retry_backoff: Duration,
    max_tokens: u32,
}

impl Composer {
    pub fn new(generator: Arc<dyn GenerationService>, retry_backoff: Duration, max_tokens: u32) -> Self {
        Self {
            generator,
            retry_backoff,
            max_tokens,
        }
    }

    pub async fn compose(
        &self,
        query: &Query,
        chunks: &[RetrievedChunk],
        style: Style,
    ) -> Result<ComposedResponse> {
        self.compose_with(query, chunks, style, &ComposeOptions::default())
            .await
    }

    pub async fn compose_with(
        &self,
        query: &Query,
        chunks: &[RetrievedChunk],
        style: Style,
        options: &ComposeOptions,
    ) -> Result<ComposedResponse> {
        if chunks.is_empty() {
            info!(query_id = %query.query_id, "No evidence retrieved; skipping generation");
            let response = no_evidence_response(style);
            if let Some(tx) = &options.progress {
                let _ = tx.send(ComposeEvent::Fragment(response.text.clone()));
            }
            return Ok(response);
        }

        let prompt = build_prompt(query, chunks, style, options.strict, &options.flagged);
        let generation = GenerationOptions {
            style,
            temperature: options.temperature,
            max_tokens: self.max_tokens,
            streaming: true,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.attempt(&prompt, &generation, chunks, options).await {
                Ok(response) => {
                    debug!(
                        query_id = %query.query_id,
                        attempt,
                        citations = response.citations.len(),
                        dropped = response.dropped_citations.len(),
                        generator = self.generator.name(),
                        "Composition complete"
                    );
                    return Ok(response);
                }
                Err(OrchestrationError::Cancelled(reason)) => {
                    return Err(OrchestrationError::Cancelled(reason));
                }
                Err(e) if attempt < MAX_GENERATION_ATTEMPTS => {
                    warn!(
                        query_id = %query.query_id,
                        attempt,
                        error = %e,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        "Generation failed - retrying"
                    );
                    if let Some(tx) = &options.progress {
                        let _ = tx.send(ComposeEvent::Restart);
                    }
                    tokio::select! {
                        biased;
                        _ = options.cancel.cancelled() => {
                            return Err(OrchestrationError::Cancelled(
                                "superseded during generation backoff".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
                Err(e) => {
                    return Err(match e {
                        OrchestrationError::GenerationUnavailable(_) => e,
                        other => OrchestrationError::GenerationUnavailable(other.to_string()),
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &Prompt,
        generation: &GenerationOptions,
        chunks: &[RetrievedChunk],
        options: &ComposeOptions,
    ) -> Result<ComposedResponse> {
        let opened = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                return Err(OrchestrationError::Cancelled("superseded before generation".to_string()));
            }
            opened = self.generator.stream(prompt, generation) => opened,
        };
        let mut stream = opened?;

        let mut assembler = CitationAssembler::new(chunks);

        loop {
            let next = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    // dropping the stream releases the underlying connection
                    drop(stream);
                    return Err(OrchestrationError::Cancelled("superseded during generation".to_string()));
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    if let Some(tx) = &options.progress {
                        let _ = tx.send(ComposeEvent::Fragment(fragment.clone()));
                    }
                    assembler.push(&fragment);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        let assembled = assembler.finish();
        Ok(ComposedResponse {
            text: assembled.text,
            citations: assembled.citations,
            style: generation.style,
            no_evidence: false,
            dropped_citations: assembled.dropped,
        })
    }
}

pub fn no_evidence_response(style: Style) -> ComposedResponse {
    ComposedResponse {
        text: NO_EVIDENCE_TEXT.to_string(),
        citations: Vec::new(),
        style,
        no_evidence: true,
        dropped_citations: Vec::new(),
    }
}

/// Render the grounded prompt. Each chunk is tagged with its identifier.
pub fn build_prompt(
    query: &Query,
    chunks: &[RetrievedChunk],
    style: Style,
    strict: bool,
    flagged: &[String],
) -> Prompt {
    let mut system = SYSTEM_PROMPT.to_string();
    match style {
        Style::Concise => {
            system.push_str("\n- Be brief: at most 6-8 steps in the procedure.");
        }
        Style::Detailed => {
            system.push_str("\n- Give rich, detailed steps with a short rationale where helpful.");
        }
    }

    if strict {
        let allowed: Vec<&str> = chunks.iter().map(|c| c.id()).collect();
        if flagged.is_empty() {
            system.push_str("\n\nA previous draft was not grounded in the sources.");
        } else {
            system.push_str(&format!(
                "\n\nA previous draft cited sources that do not support it ({}).",
                flagged.join(", ")
            ));
        }
        system.push_str(&format!(
            " Every claim needs a citation. Cite only these identifiers: {}.",
            allowed.join(", ")
        ));
    }

    let sources: Vec<PromptSource> = chunks
        .iter()
        .map(|c| PromptSource {
            chunk_id: c.id().to_string(),
            label: c.chunk.label(),
            text: c.chunk.text.clone(),
        })
        .collect();

    let context = sources
        .iter()
        .map(|s| format!("[{}] Source: {}\n{}", s.chunk_id, s.label, s.text))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    Prompt {
        system,
        user: format!("Context:\n{}\n\nQuestion: {}\nAnswer:", context, query.text),
        sources,
    }
}

//
// ================= Citation Assembly =================
//

#[derive(Debug, Clone)]
pub struct AssembledText {
    pub text: String,
    pub citations: Vec<Citation>,
    pub dropped: Vec<String>,
}

/// Incrementally extracts citation markers from streamed text.
///
/// A marker is a bracketed, comma- or semicolon-separated list of
/// identifiers. Markers are only resolved once their closing bracket has
/// arrived, so a marker split across fragments is never misread.
pub struct CitationAssembler {
    allowed: HashSet<String>,
    /// Source label (e.g. `guide.pdf p2`) → best-ranked chunk id.
    aliases: HashMap<String, String>,
    text: String,
    scan_from: usize,
    citations: Vec<Citation>,
    dropped: Vec<String>,
    last_marker_end: usize,
    last_span: Option<(usize, usize)>,
}

impl CitationAssembler {
    pub fn new(chunks: &[RetrievedChunk]) -> Self {
        let allowed = chunks.iter().map(|c| c.id().to_string()).collect();

        let mut aliases = HashMap::new();
        for chunk in chunks {
            aliases
                .entry(chunk.chunk.label().to_lowercase())
                .or_insert_with(|| chunk.id().to_string());
        }

        Self {
            allowed,
            aliases,
            text: String::new(),
            scan_from: 0,
            citations: Vec::new(),
            dropped: Vec::new(),
            last_marker_end: 0,
            last_span: None,
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.scan();
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    fn scan(&mut self) {
        loop {
            let Some(rel_open) = self.text[self.scan_from..].find('[') else {
                self.scan_from = self.text.len();
                return;
            };
            let open = self.scan_from + rel_open;
            let body_start = open + 1;

            let Some(rel_stop) = self.text[body_start..].find([']', '[', '\n']) else {
                let partial = &self.text[body_start..];
                if partial.len() > MAX_MARKER_LEN || !partial.chars().all(is_marker_char) {
                    self.scan_from = body_start;
                    continue;
                }
                // wait for more text
                self.scan_from = open;
                return;
            };

            let stop = body_start + rel_stop;
            if !self.text[stop..].starts_with(']') {
                self.scan_from = stop;
                continue;
            }

            let body = self.text[body_start..stop].to_string();
            if let Some(ids) = self.parse_marker(&body) {
                self.accept(open, stop + 1, ids);
            }
            self.scan_from = stop + 1;
        }
    }

    /// `None` when the bracket is ordinary prose rather than a citation.
    fn parse_marker(&self, body: &str) -> Option<Vec<String>> {
        if let Some(id) = self.aliases.get(&body.trim().to_lowercase()) {
            return Some(vec![id.clone()]);
        }

        let parts: Vec<&str> = body.split([',', ';']).map(str::trim).collect();
        if parts
            .iter()
            .any(|p| p.is_empty() || p.chars().any(char::is_whitespace))
        {
            return None;
        }

        let is_citation = parts
            .iter()
            .any(|p| self.allowed.contains(*p) || looks_like_reference(p));
        is_citation.then(|| parts.iter().map(|p| p.to_string()).collect())
    }

    fn accept(&mut self, marker_start: usize, marker_end: usize, ids: Vec<String>) {
        let (span_start, span_end) = self.claim_span(marker_start);

        for id in ids {
            if self.allowed.contains(&id) {
                self.citations.push(Citation {
                    chunk_id: id,
                    span_start,
                    span_end,
                });
            } else {
                self.dropped.push(id);
            }
        }

        self.last_marker_end = marker_end;
        self.last_span = Some((span_start, span_end));
    }

    /// The text a marker at `marker_start` vouches for: back to the previous
    /// sentence boundary or marker, whichever is closer.
    fn claim_span(&self, marker_start: usize) -> (usize, usize) {
        if let Some(span) = self.last_span {
            if self.text[self.last_marker_end..marker_start].trim().is_empty() {
                return span;
            }
        }

        let head = self.text[..marker_start].trim_end();
        let end = head.len();
        let body = head.trim_end_matches(['.', '!', '?']);
        let boundary = body
            .rfind(['.', '!', '?', '\n'])
            .map(|i| i + 1)
            .unwrap_or(0);
        let start = boundary.max(self.last_marker_end.min(end));

        let segment = &self.text[start..end];
        let start = start + (segment.len() - segment.trim_start().len());
        (start.min(end), end)
    }

    /// Finalize. A marker still open at the end of the stream is treated as
    /// absent and trimmed from the text.
    pub fn finish(mut self) -> AssembledText {
        if self.scan_from < self.text.len() && self.text[self.scan_from..].starts_with('[') {
            let partial = &self.text[self.scan_from + 1..];
            if partial.chars().all(is_marker_char) {
                self.text.truncate(self.scan_from);
                let trimmed = self.text.trim_end().len();
                self.text.truncate(trimmed);
            }
        }

        AssembledText {
            text: self.text,
            citations: self.citations,
            dropped: self.dropped,
        }
    }
}

fn is_marker_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '#' | ',' | ';' | ' ')
}

/// Shaped like a chunk id (`doc-p2-c0`, `guide.pdf#3`) rather than a word.
fn looks_like_reference(part: &str) -> bool {
    part.chars().all(|c| is_marker_char(c) && c != ' ')
        && part
            .chars()
            .any(|c| c.is_ascii_digit() || matches!(c, '-' | '_' | '.' | ':' | '/' | '#'))
}
