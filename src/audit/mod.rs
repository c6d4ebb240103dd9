//! Audit trail
//!
//! Append-only record of every pipeline decision and every action-state
//! transition, queryable by query or session. Each record carries a SHA-256
//! digest of its payload for integrity checks.

use crate::config::CopilotConfig;
use crate::models::{ActionTransition, DecisionLogEntry};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

mod jsonl;
mod postgres;

pub use jsonl::JsonlAuditStore;
pub use postgres::PostgresAuditStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditPayload {
    Decision(DecisionLogEntry),
    Transition(ActionTransition),
}

impl AuditPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditPayload::Decision(_) => "decision",
            AuditPayload::Transition(_) => "transition",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub record_id: Uuid,
    pub query_id: Uuid,
    pub session_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub payload: AuditPayload,
    pub digest: String,
}

impl AuditRecord {
    pub fn decision(entry: DecisionLogEntry) -> Self {
        Self::new(entry.query_id, entry.session_id, AuditPayload::Decision(entry))
    }

    pub fn transition(transition: ActionTransition) -> Self {
        Self::new(
            transition.query_id,
            transition.session_id,
            AuditPayload::Transition(transition),
        )
    }

    fn new(query_id: Uuid, session_id: Uuid, payload: AuditPayload) -> Self {
        let digest = compute_digest(&payload);
        Self {
            record_id: Uuid::new_v4(),
            query_id,
            session_id,
            recorded_at: Utc::now(),
            payload,
            digest,
        }
    }

    /// Recompute the payload digest and compare.
    pub fn verify_integrity(&self) -> bool {
        compute_digest(&self.payload) == self.digest
    }
}

/// SHA-256 of the payload's JSON form, streamed straight into the hasher.
pub fn compute_digest(payload: &AuditPayload) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), payload).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Append-only audit store. Implementations must tolerate concurrent
/// appenders; each record is written atomically.
#[async_trait]
pub trait AuditStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn record(&self, record: AuditRecord) -> Result<()>;

    /// Records for one query, in append order.
    async fn for_query(&self, query_id: Uuid) -> Result<Vec<AuditRecord>>;

    /// Records for one session, in append order.
    async fn for_session(&self, session_id: Uuid) -> Result<Vec<AuditRecord>>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }

    async fn record_decisions(&self, entries: &[DecisionLogEntry]) -> Result<()> {
        for entry in entries {
            self.record(AuditRecord::decision(entry.clone())).await?;
        }
        Ok(())
    }

    async fn record_transition(&self, transition: &ActionTransition) -> Result<()> {
        self.record(AuditRecord::transition(transition.clone())).await
    }
}

/// Process-local audit store
pub struct InMemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    fn backend(&self) -> &'static str {
        "in-memory"
    }

    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn for_query(&self, query_id: Uuid) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.query_id == query_id)
            .cloned()
            .collect())
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }
}

/// Postgres when a database URL is configured, else a JSONL file when a
/// path is configured, else in-memory.
pub async fn build_audit_store(config: &CopilotConfig) -> Result<Arc<dyn AuditStore>> {
    if let Some(url) = &config.database_url {
        match PostgresAuditStore::connect_lazy(url) {
            Ok(store) => {
                info!("Audit backend: postgres");
                return Ok(Arc::new(store));
            }
            Err(error) => {
                warn!(error = %error, "Postgres audit backend unavailable, falling back");
            }
        }
    }

    if let Some(path) = &config.audit_log_path {
        let store = JsonlAuditStore::open(path).await?;
        info!(path = %path.display(), "Audit backend: jsonl");
        return Ok(Arc::new(store));
    }

    info!("Audit backend: in-memory");
    Ok(Arc::new(InMemoryAuditStore::new()))
}
