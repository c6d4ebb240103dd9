//! Process configuration
//!
//! Loaded once at startup from `.env` and the process environment.

use crate::error::OrchestrationError;
use crate::models::Style;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What the orchestrator does when the critic rejects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingPolicy {
    /// Append a caveat and flag low confidence.
    Caveat,
    /// Recompose once, then fall back to `Caveat`.
    Recompose,
}

impl FromStr for GroundingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "caveat" => Ok(GroundingPolicy::Caveat),
            "recompose" => Ok(GroundingPolicy::Recompose),
            other => Err(format!("unknown grounding policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub max_k: usize,
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 4,
            max_k: 8,
            min_score: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CritiqueConfig {
    pub threshold: f32,
    /// Lexical overlap floor; `None` disables the content check.
    pub content_floor: Option<f32>,
    pub policy: GroundingPolicy,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            content_floor: Some(0.15),
            policy: GroundingPolicy::Recompose,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub style: Style,
    pub retry_backoff: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "openai/gpt-oss-20b".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            max_tokens: 768,
            temperature: 0.2,
            style: Style::Detailed,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopilotConfig {
    pub retrieval: RetrievalConfig,
    pub critique: CritiqueConfig,
    pub generation: GenerationConfig,
    pub corpus_path: PathBuf,
    pub ops_api_url: String,
    pub operator_name: String,
    pub audit_log_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub api_port: u16,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            critique: CritiqueConfig::default(),
            generation: GenerationConfig::default(),
            corpus_path: PathBuf::from("data/chunks.json"),
            ops_api_url: "http://localhost:8001".to_string(),
            operator_name: "demo_user".to_string(),
            audit_log_path: None,
            database_url: None,
            api_port: 8080,
        }
    }
}

impl CopilotConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("TOP_K") {
            config.retrieval.default_k = parse_value("TOP_K", &v)?;
        }
        if let Some(v) = get("MAX_K") {
            config.retrieval.max_k = parse_value("MAX_K", &v)?;
        }
        if let Some(v) = get("MIN_SCORE") {
            config.retrieval.min_score = parse_value("MIN_SCORE", &v)?;
        }
        if config.retrieval.max_k == 0 {
            return Err(OrchestrationError::ConfigError(
                "MAX_K must be at least 1".to_string(),
            ));
        }

        if let Some(v) = get("GROUNDING_THRESHOLD") {
            let threshold: f32 = parse_value("GROUNDING_THRESHOLD", &v)?;
            if !(0.0..=1.0).contains(&threshold) {
                return Err(OrchestrationError::ConfigError(format!(
                    "GROUNDING_THRESHOLD must be within [0, 1], got {}",
                    threshold
                )));
            }
            config.critique.threshold = threshold;
        }
        if let Some(v) = get("CONTENT_OVERLAP_FLOOR") {
            let floor: f32 = parse_value("CONTENT_OVERLAP_FLOOR", &v)?;
            config.critique.content_floor = (floor > 0.0).then_some(floor);
        }
        if let Some(v) = get("GROUNDING_POLICY") {
            config.critique.policy = parse_value("GROUNDING_POLICY", &v)?;
        }

        config.generation.api_key = get("GROQ_API_KEY");
        if let Some(v) = get("GROQ_MODEL") {
            config.generation.model = v;
        }
        if let Some(v) = get("GROQ_BASE_URL") {
            config.generation.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("MAX_TOKENS") {
            config.generation.max_tokens = parse_value("MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("TEMPERATURE") {
            config.generation.temperature = parse_value("TEMPERATURE", &v)?;
        }
        if let Some(v) = get("RESPONSE_STYLE") {
            config.generation.style = parse_value("RESPONSE_STYLE", &v)?;
        }
        if let Some(v) = get("GENERATION_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_value("GENERATION_RETRY_BACKOFF_MS", &v)?;
            config.generation.retry_backoff = Duration::from_millis(ms);
        }

        if let Some(v) = get("CORPUS_PATH") {
            config.corpus_path = PathBuf::from(v);
        }
        if let Some(v) = get("OPS_API_URL") {
            config.ops_api_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("OPERATOR_NAME") {
            config.operator_name = v;
        }
        config.audit_log_path = get("AUDIT_LOG_PATH").map(PathBuf::from);
        config.database_url = get("POSTGRES_URL").or_else(|| get("DATABASE_URL"));

        if let Some(v) = get("PORT").or_else(|| get("API_PORT")) {
            config.api_port = parse_value("PORT", &v)?;
        }

        Ok(config)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        OrchestrationError::ConfigError(format!("{} has invalid value '{}': {}", key, raw, e))
    })
}
