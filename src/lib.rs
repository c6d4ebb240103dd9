//! Operations Copilot
//!
//! Answers operators' questions from an internal document corpus with
//! verifiable citations, and turns operational commands into action
//! requests that a human approves before anything is sent.
//!
//! UNIFIED LOOP:
//! INPUT → ROUTE → (RETRIEVE → COMPOSE → CRITIQUE → RECOMPOSE?) | PARSE ACTION → COMPLETE

pub mod actions;
pub mod agent;
pub mod api;
pub mod audit;
pub mod composer;
pub mod config;
pub mod critic;
pub mod error;
pub mod generation;
pub mod models;
pub mod retrieval;
pub mod router;
pub mod runtime;
pub mod session;
pub mod text;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use models::*;
pub use agent::Orchestrator;
pub use config::CopilotConfig;
pub use runtime::Copilot;
