//! Generation service seam
//!
//! The composer talks to a `GenerationService`. Output arrives as a lazy,
//! finite, non-restartable stream of text fragments.

use crate::models::Style;
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;

pub mod groq;
pub mod offline;

pub use groq::GroqClient;
pub use offline::ExtractiveGenerator;

/// Incremental generation output.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOptions {
    pub style: Style,
    pub temperature: f32,
    pub max_tokens: u32,
    pub streaming: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            style: Style::Detailed,
            temperature: 0.2,
            max_tokens: 768,
            streaming: true,
        }
    }
}

/// Evidence rendered into a prompt, kept structured for generators that
/// work from sources directly.
#[derive(Debug, Clone)]
pub struct PromptSource {
    pub chunk_id: String,
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub sources: Vec<PromptSource>,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            sources: Vec::new(),
        }
    }
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a fragment stream. Errors here and inside the stream both mean
    /// the service is unavailable.
    async fn stream(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<TokenStream>;

    /// Whole-text generation; defaults to draining `stream`.
    async fn generate(&self, prompt: &Prompt, options: &GenerationOptions) -> Result<String> {
        let mut stream = self.stream(prompt, options).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}
