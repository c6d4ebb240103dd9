//! Critic stage
//!
//! Rules-based grounding check on a composed response. Deterministic and
//! synchronous: no I/O, no model calls.

use crate::config::CritiqueConfig;
use crate::models::{
    Chunk, Citation, ComposedResponse, CritiqueResult, GroundingCheck, RetrievedChunk,
    UnsupportedCitation, UnsupportedReason, Verdict,
};
use crate::text::{content_terms, terms};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// A single check applied to every citation.
pub trait GroundingRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reported on the unsupported citation when this rule fails.
    fn failure_reason(&self) -> UnsupportedReason;

    /// `chunk` is `None` when the cited id is not in the retrieved set.
    fn check(&self, citation: &Citation, span: &str, chunk: Option<&Chunk>) -> RuleOutcome;
}

pub struct RuleOutcome {
    pub passed: bool,
    pub details: String,
}

pub struct Critic {
    rules: Vec<Box<dyn GroundingRule>>,
    threshold: f32,
}

impl Critic {
    /// A critic with no rules; every citation counts as supported.
    pub fn new(threshold: f32) -> Self {
        Self {
            rules: Vec::new(),
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn add_rule(&mut self, rule: Box<dyn GroundingRule>) {
        self.rules.push(rule);
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn critique(&self, response: &ComposedResponse, chunks: &[RetrievedChunk]) -> CritiqueResult {
        let retrieved: HashMap<&str, &Chunk> = chunks
            .iter()
            .map(|c| (c.id(), c.chunk.as_ref()))
            .collect();

        let mut checks = Vec::new();
        let mut unsupported = Vec::new();
        let mut supported = 0usize;

        for citation in &response.citations {
            let span = response.span_text(citation);
            let chunk = retrieved.get(citation.chunk_id.as_str()).copied();

            // first failing rule decides the reason
            let mut failure = None;
            for rule in &self.rules {
                let outcome = rule.check(citation, span, chunk);
                checks.push(GroundingCheck {
                    rule_name: rule.name().to_string(),
                    chunk_id: citation.chunk_id.clone(),
                    passed: outcome.passed,
                    details: outcome.details,
                });
                if !outcome.passed {
                    failure = Some(rule.failure_reason());
                    break;
                }
            }

            match failure {
                Some(reason) => unsupported.push(UnsupportedCitation {
                    chunk_id: citation.chunk_id.clone(),
                    reason,
                }),
                None => supported += 1,
            }
        }

        for id in &response.dropped_citations {
            unsupported.push(UnsupportedCitation {
                chunk_id: id.clone(),
                reason: UnsupportedReason::DroppedByComposer,
            });
        }

        let total = response.citations.len() + response.dropped_citations.len();
        let grounding_score = grounding_score(supported, total, chunks.len());

        let verdict = if grounding_score >= self.threshold && unsupported.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        info!(
            citations = total,
            supported,
            unsupported = unsupported.len(),
            grounding_score,
            verdict = ?verdict,
            "Critique completed"
        );

        CritiqueResult {
            grounding_score,
            threshold: self.threshold,
            unsupported,
            checks,
            verdict,
            critiqued_at: Utc::now(),
        }
    }
}

/// Fraction of citations that hold up, clamped to `[0, 1]`.
///
/// No evidence and no claims is vacuously grounded. Evidence with no
/// citations, or citations with no evidence, scores zero.
pub fn grounding_score(supported: usize, total: usize, retrieved: usize) -> f32 {
    match (total, retrieved) {
        (0, 0) => 1.0,
        (0, _) | (_, 0) => 0.0,
        _ => (supported as f32 / total as f32).clamp(0.0, 1.0),
    }
}

//
// ================= Rules =================
//

/// Rule: the cited chunk must be one that was retrieved for this query.
pub struct StructuralGrounding;

impl GroundingRule for StructuralGrounding {
    fn name(&self) -> &'static str {
        "cited_chunk_retrieved"
    }

    fn failure_reason(&self) -> UnsupportedReason {
        UnsupportedReason::NotRetrieved
    }

    fn check(&self, citation: &Citation, _span: &str, chunk: Option<&Chunk>) -> RuleOutcome {
        RuleOutcome {
            passed: chunk.is_some(),
            details: match chunk {
                Some(_) => format!("{} is in the retrieved set", citation.chunk_id),
                None => format!("{} was not retrieved for this query", citation.chunk_id),
            },
        }
    }
}

/// Rule: the cited span must share vocabulary with the chunk.
///
/// Share of the span's content terms found in the chunk. A span with no
/// content terms passes.
pub struct LexicalOverlap {
    pub floor: f32,
}

impl GroundingRule for LexicalOverlap {
    fn name(&self) -> &'static str {
        "lexical_overlap"
    }

    fn failure_reason(&self) -> UnsupportedReason {
        UnsupportedReason::LowOverlap
    }

    fn check(&self, _citation: &Citation, span: &str, chunk: Option<&Chunk>) -> RuleOutcome {
        let Some(chunk) = chunk else {
            return RuleOutcome {
                passed: false,
                details: "no chunk to compare against".to_string(),
            };
        };

        let span_terms = content_terms(span);
        if span_terms.is_empty() {
            return RuleOutcome {
                passed: true,
                details: "span has no content terms".to_string(),
            };
        }

        let chunk_terms: HashSet<String> = terms(&chunk.text).collect();
        let matched = span_terms.iter().filter(|t| chunk_terms.contains(*t)).count();
        let overlap = matched as f32 / span_terms.len() as f32;

        RuleOutcome {
            passed: overlap >= self.floor,
            details: format!(
                "overlap {:.2} ({}/{} terms), floor {:.2}",
                overlap,
                matched,
                span_terms.len(),
                self.floor
            ),
        }
    }
}

/// Critic with the standard rule set for a configuration.
pub fn create_default_critic(config: &CritiqueConfig) -> Critic {
    let mut critic = Critic::new(config.threshold);
    critic.add_rule(Box::new(StructuralGrounding));
    if let Some(floor) = config.content_floor {
        critic.add_rule(Box::new(LexicalOverlap { floor }));
    }
    critic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, Style};
    use std::sync::Arc;

    fn retrieved(id: &str, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Arc::new(Chunk {
                chunk_id: id.to_string(),
                document_id: "doc".to_string(),
                text: text.to_string(),
                metadata: ChunkMetadata::default(),
            }),
            score: 0.8,
            rank: 1,
        }
    }

    /// Builds a response where each `(sentence, id)` is followed by `[id]`.
    fn response(parts: &[(&str, &str)]) -> ComposedResponse {
        let mut text = String::new();
        let mut citations = Vec::new();
        for (sentence, id) in parts {
            let start = text.len();
            text.push_str(sentence);
            citations.push(Citation {
                chunk_id: id.to_string(),
                span_start: start,
                span_end: text.len(),
            });
            text.push_str(&format!(" [{}]. ", id));
        }
        ComposedResponse {
            text,
            citations,
            style: Style::Detailed,
            no_evidence: false,
            dropped_citations: Vec::new(),
        }
    }

    fn critic() -> Critic {
        create_default_critic(&CritiqueConfig::default())
    }

    #[test]
    fn test_all_supported_passes() {
        let chunks = vec![
            retrieved("a", "Collect the signed merchant agreement before activation."),
            retrieved("b", "Verify bank details with the finance team."),
        ];
        let response = response(&[
            ("Collect the signed merchant agreement", "a"),
            ("Verify bank details", "b"),
        ]);

        let result = critic().critique(&response, &chunks);
        assert!(result.passed());
        assert_eq!(result.grounding_score, 1.0);
        assert!(result.unsupported.is_empty());
    }

    #[test]
    fn test_unretrieved_citation_fails() {
        let chunks = vec![retrieved("a", "Collect the signed merchant agreement.")];
        let response = response(&[
            ("Collect the signed merchant agreement", "a"),
            ("Refunds settle in five days", "z"),
        ]);

        let result = critic().critique(&response, &chunks);
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.grounding_score, 0.5);
        assert_eq!(
            result.unsupported,
            vec![UnsupportedCitation {
                chunk_id: "z".to_string(),
                reason: UnsupportedReason::NotRetrieved,
            }]
        );
    }

    #[test]
    fn test_low_overlap_is_unsupported() {
        let chunks = vec![retrieved("a", "Payout schedules run weekly.")];
        let response = response(&[("Menu items can be paused from the portal", "a")]);

        let result = critic().critique(&response, &chunks);
        assert_eq!(result.unsupported[0].reason, UnsupportedReason::LowOverlap);
        assert_eq!(result.grounding_score, 0.0);
    }

    #[test]
    fn test_overlap_rule_disabled_by_config() {
        let config = CritiqueConfig {
            content_floor: None,
            ..Default::default()
        };
        let chunks = vec![retrieved("a", "Payout schedules run weekly.")];
        let response = response(&[("Menu items can be paused from the portal", "a")]);

        assert!(create_default_critic(&config)
            .critique(&response, &chunks)
            .passed());
    }

    #[test]
    fn test_empty_evidence_and_no_citations_passes() {
        let response = ComposedResponse {
            text: "No evidence found.".to_string(),
            citations: Vec::new(),
            style: Style::Concise,
            no_evidence: true,
            dropped_citations: Vec::new(),
        };
        let result = critic().critique(&response, &[]);
        assert!(result.passed());
        assert_eq!(result.grounding_score, 1.0);
    }

    #[test]
    fn test_dropped_citations_are_unsupported() {
        let chunks = vec![retrieved("a", "Collect the signed merchant agreement.")];
        let mut response = response(&[("Collect the signed merchant agreement", "a")]);
        response.dropped_citations.push("ghost-p1".to_string());

        let result = critic().critique(&response, &chunks);
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(result.grounding_score, 0.5);
        assert_eq!(
            result.unsupported[0].reason,
            UnsupportedReason::DroppedByComposer
        );
    }

    #[test]
    fn test_score_edges() {
        assert_eq!(grounding_score(0, 0, 0), 1.0);
        assert_eq!(grounding_score(0, 0, 3), 0.0);
        assert_eq!(grounding_score(0, 2, 0), 0.0);
        assert_eq!(grounding_score(3, 3, 3), 1.0);
    }
}
