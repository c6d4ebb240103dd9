//! Postgres audit table
//!
//! Payloads are stored as JSON text next to their digest so rows can be
//! re-verified after the fact.

use super::{AuditPayload, AuditRecord, AuditStore};
use crate::error::OrchestrationError;
use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

pub struct PostgresAuditStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresAuditStore {
    /// Build the pool without connecting; the first query connects.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| OrchestrationError::DatabaseError(format!("invalid database URL: {}", e)))?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS audit_records (
                      seq BIGSERIAL PRIMARY KEY,
                      record_id UUID NOT NULL UNIQUE,
                      query_id UUID NOT NULL,
                      session_id UUID NOT NULL,
                      kind TEXT NOT NULL,
                      payload TEXT NOT NULL,
                      digest TEXT NOT NULL,
                      recorded_at TIMESTAMPTZ NOT NULL
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_audit_records_query ON audit_records (query_id, seq);",
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_audit_records_session ON audit_records (session_id, seq);",
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!(
                    "Failed to initialize audit schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    async fn fetch(&self, column: &str, id: Uuid) -> Result<Vec<AuditRecord>> {
        self.ensure_schema().await?;

        let sql = format!(
            "SELECT record_id, query_id, session_id, payload, digest, recorded_at \
             FROM audit_records WHERE {} = $1 ORDER BY seq ASC",
            column
        );

        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                OrchestrationError::DatabaseError(format!("Failed to load audit records: {}", e))
            })?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<AuditRecord> {
    let payload: String = row.try_get("payload")?;
    let payload: AuditPayload = serde_json::from_str(&payload)?;

    Ok(AuditRecord {
        record_id: row.try_get("record_id")?,
        query_id: row.try_get("query_id")?,
        session_id: row.try_get("session_id")?,
        recorded_at: row.try_get("recorded_at")?,
        payload,
        digest: row.try_get("digest")?,
    })
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn record(&self, record: AuditRecord) -> Result<()> {
        self.ensure_schema().await?;

        let payload = serde_json::to_string(&record.payload)?;

        sqlx::query(
            r#"
            INSERT INTO audit_records
              (record_id, query_id, session_id, kind, payload, digest, recorded_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.record_id)
        .bind(record.query_id)
        .bind(record.session_id)
        .bind(record.payload.kind())
        .bind(payload)
        .bind(&record.digest)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestrationError::DatabaseError(format!("Failed to append audit record: {}", e))
        })?;

        Ok(())
    }

    async fn for_query(&self, query_id: Uuid) -> Result<Vec<AuditRecord>> {
        self.fetch("query_id", query_id).await
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<AuditRecord>> {
        self.fetch("session_id", session_id).await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
