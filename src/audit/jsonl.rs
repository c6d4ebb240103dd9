//! JSON-lines audit file
//!
//! One record per line. Appends go through a single mutex-guarded handle
//! and each line is written with one `write_all`, so concurrent appenders
//! never interleave.

use super::{AuditRecord, AuditStore};
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub struct JsonlAuditStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlAuditStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                OrchestrationError::AuditError(format!(
                    "cannot open audit log {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_matching<F>(&self, keep: F) -> Result<Vec<AuditRecord>>
    where
        F: Fn(&AuditRecord) -> bool,
    {
        // make buffered appends visible before reading back
        self.flush().await?;

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) if keep(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), line = line_no + 1, error = %e, "Skipping malformed audit line");
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    fn backend(&self) -> &'static str {
        "jsonl"
    }

    async fn record(&self, record: AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| OrchestrationError::AuditError("audit log is closed".to_string()))?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn for_query(&self, query_id: Uuid) -> Result<Vec<AuditRecord>> {
        self.read_matching(|r| r.query_id == query_id).await
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<AuditRecord>> {
        self.read_matching(|r| r.session_id == session_id).await
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}
