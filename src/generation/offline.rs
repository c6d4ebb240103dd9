//! Extractive offline generator
//!
//! Used when no hosted model is configured. Answers with the leading
//! sentence of each source followed by its citation marker.

use crate::generation::{GenerationOptions, GenerationService, Prompt, PromptSource, TokenStream};
use crate::models::Style;
use crate::Result;
use async_trait::async_trait;

const CONCISE_SOURCE_LIMIT: usize = 3;
const LEAD_MAX_CHARS: usize = 240;

#[derive(Debug, Default, Clone)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self
    }

    fn render(sources: &[PromptSource], style: Style) -> String {
        if sources.is_empty() {
            return "I could not find supporting documentation for this question.".to_string();
        }

        let take = match style {
            Style::Concise => CONCISE_SOURCE_LIMIT.min(sources.len()),
            Style::Detailed => sources.len(),
        };

        let mut out = format!(
            "Summary: drawn from the {} most relevant source(s).\n\n",
            take
        );
        for (i, source) in sources.iter().take(take).enumerate() {
            out.push_str(&format!(
                "{}. {} [{}]\n",
                i + 1,
                lead_sentence(&source.text),
                source.chunk_id
            ));
        }
        if style == Style::Detailed {
            out.push_str("\nNotes: generated without a language model; consult the cited sources for full procedures.");
        }
        out
    }
}

/// First sentence of `text`, whitespace-collapsed and capped.
fn lead_sentence(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(['[', ']'], "");

    let end = collapsed
        .find(|c: char| matches!(c, '.' | '!' | '?'))
        .map(|i| i + 1)
        .unwrap_or(collapsed.len());
    let sentence = &collapsed[..end];

    if sentence.chars().count() <= LEAD_MAX_CHARS {
        sentence.to_string()
    } else {
        let mut capped: String = sentence.chars().take(LEAD_MAX_CHARS).collect();
        capped.push('…');
        capped
    }
}

#[async_trait]
impl GenerationService for ExtractiveGenerator {
    fn name(&self) -> &'static str {
        "extractive"
    }

    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TokenStream> {
        let text = Self::render(&prompt.sources, options.style);
        let fragments: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}
