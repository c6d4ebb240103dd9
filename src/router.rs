//! Intent router
//!
//! Decides whether a query is a knowledge question or an operational
//! command. Deterministic keyword rules first; a generation-backed
//! classifier only when no rule applies.

use crate::actions::{match_verb_at, normalize_token, opens_quote, politeness_len};
use crate::generation::{GenerationOptions, GenerationService, Prompt};
use crate::models::{DecisionLog, Intent, Query, Stage};
use crate::Result;
use crate::error::OrchestrationError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Leading words that mark a question.
const INTERROGATIVES: &[&str] = &[
    "what", "how", "why", "when", "where", "which", "who", "whom", "whose", "is", "are",
    "does", "do", "did", "can", "could", "should", "would", "will", "was", "were",
];

/// Imperatives that name an operation outside the allow-list. Routed to the
/// action path so the parser can refuse them explicitly.
const OUT_OF_SCOPE_COMMANDS: &[&str] = &[
    "delete", "remove", "drop", "cancel", "disable", "enable", "shutdown", "restart",
    "refund", "archive", "purge", "wipe", "truncate", "close", "stop", "terminate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteBasis {
    /// Supported verb without question phrasing.
    ActionVerb,
    /// Question phrasing with the verb in command position.
    CommandPosition,
    /// Question phrasing with the verb used descriptively.
    QuestionPhrasing,
    /// Imperative naming an unsupported operation.
    UnsupportedCommand,
    Classifier,
    /// Classifier absent, failed or unparseable.
    Default,
}

impl fmt::Display for RouteBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteBasis::ActionVerb => "action_verb",
            RouteBasis::CommandPosition => "command_position",
            RouteBasis::QuestionPhrasing => "question_phrasing",
            RouteBasis::UnsupportedCommand => "unsupported_command",
            RouteBasis::Classifier => "classifier",
            RouteBasis::Default => "default",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub intent: Intent,
    pub basis: RouteBasis,
}

/// Fallback classification for queries no rule recognizes.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Intent>;
}

/// Asks the generation service for a one-word label.
pub struct LlmIntentClassifier {
    generator: Arc<dyn GenerationService>,
}

impl LlmIntentClassifier {
    pub fn new(generator: Arc<dyn GenerationService>) -> Self {
        Self { generator }
    }
}

const CLASSIFIER_PROMPT: &str = "Classify the operator's message for an operations copilot. \
Answer \"action\" if it asks to change something in a live system (pause or unpause an item, \
change opening hours, or any other operation). Answer \"knowledge\" if it asks for information \
or a procedure. Reply with exactly one word: knowledge or action.";

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, text: &str) -> Result<Intent> {
        let prompt = Prompt::new(CLASSIFIER_PROMPT, format!("Message: {}\nLabel:", text));
        let options = GenerationOptions {
            temperature: 0.0,
            max_tokens: 4,
            streaming: false,
            ..Default::default()
        };

        let answer = self.generator.generate(&prompt, &options).await?;
        parse_label(&answer).ok_or_else(|| {
            OrchestrationError::GenerationUnavailable(format!(
                "unparseable classifier answer '{}'",
                answer.trim()
            ))
        })
    }
}

fn parse_label(answer: &str) -> Option<Intent> {
    let word = answer.split_whitespace().next().map(normalize_token)?;
    match word.as_str() {
        "action" => Some(Intent::Action),
        "knowledge" => Some(Intent::Knowledge),
        _ => None,
    }
}

pub struct Router {
    classifier: Option<Arc<dyn IntentClassifier>>,
}

impl Router {
    pub fn new(classifier: Option<Arc<dyn IntentClassifier>>) -> Self {
        Self { classifier }
    }

    /// Rules only; no classifier fallback.
    pub fn rules_only() -> Self {
        Self { classifier: None }
    }

    /// Classify and append one decision-log entry. Never fails.
    pub async fn classify(&self, query: &Query, log: &mut DecisionLog) -> Intent {
        let decision = self.decide(query).await;
        log.record(
            Stage::Router,
            &query.text,
            format!("{} ({})", decision.intent, decision.basis),
        );
        decision.intent
    }

    pub async fn decide(&self, query: &Query) -> RouteDecision {
        if let Some(decision) = route_by_rules(&query.text) {
            debug!(query_id = %query.query_id, intent = %decision.intent, basis = %decision.basis, "Routed by rule");
            return decision;
        }

        let Some(classifier) = &self.classifier else {
            return RouteDecision {
                intent: Intent::Knowledge,
                basis: RouteBasis::Default,
            };
        };

        match classifier.classify(&query.text).await {
            Ok(intent) => RouteDecision {
                intent,
                basis: RouteBasis::Classifier,
            },
            Err(e) => {
                warn!(query_id = %query.query_id, error = %e, "Intent classifier failed; defaulting to knowledge");
                RouteDecision {
                    intent: Intent::Knowledge,
                    basis: RouteBasis::Default,
                }
            }
        }
    }
}

/// Deterministic routing. `None` when no rule applies.
pub fn route_by_rules(text: &str) -> Option<RouteDecision> {
    let raw: Vec<&str> = text.split_whitespace().collect();
    let tokens: Vec<String> = raw.iter().map(|w| normalize_token(w)).collect();
    let lead = politeness_len(&tokens);

    let question = text.trim_end().ends_with('?')
        || tokens
            .iter()
            .find(|t| !t.is_empty())
            .map(|t| INTERROGATIVES.contains(&t.as_str()))
            .unwrap_or(false);

    let found = (0..tokens.len()).find_map(|i| match_verb_at(&tokens, i).map(|(_, span)| (i, span)));

    let Some((at, span)) = found else {
        let first = tokens.get(lead).map(String::as_str).unwrap_or("");
        if !question && OUT_OF_SCOPE_COMMANDS.contains(&first) {
            return Some(RouteDecision {
                intent: Intent::Action,
                basis: RouteBasis::UnsupportedCommand,
            });
        }
        return None;
    };

    if !question {
        return Some(RouteDecision {
            intent: Intent::Action,
            basis: RouteBasis::ActionVerb,
        });
    }

    let sentence_initial = at == lead;
    let quoted_target = opens_quote(raw.get(at + span));

    if sentence_initial || quoted_target {
        Some(RouteDecision {
            intent: Intent::Action,
            basis: RouteBasis::CommandPosition,
        })
    } else {
        Some(RouteDecision {
            intent: Intent::Knowledge,
            basis: RouteBasis::QuestionPhrasing,
        })
    }
}
