//! Postgres-backed report documents (JSONB, row-locked partial updates).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{DocumentStore, StoreError, UpdateDescriptor};

const CREATE_REPORTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reports (
    id          TEXT PRIMARY KEY,
    doc         JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_REPORTS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, report_id: &str) -> Result<Option<JsonValue>, StoreError> {
        let row = sqlx::query("SELECT doc FROM reports WHERE id = $1")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("doc")?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, report_id: &str, doc: JsonValue) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO reports (id, doc)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(report_id)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                report_id: report_id.to_string(),
            });
        }
        Ok(())
    }

    /// The row lock held for the transaction makes read-apply-write a single
    /// atomic step for every other writer and reader.
    async fn update(&self, report_id: &str, update: &UpdateDescriptor) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM reports WHERE id = $1 FOR UPDATE")
            .bind(report_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::ReportNotFound {
                report_id: report_id.to_string(),
            });
        };
        let mut doc: JsonValue = row.try_get("doc")?;
        update.apply(&mut doc)?;

        sqlx::query(
            r#"
            UPDATE reports
               SET doc = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(report_id)
        .bind(doc)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
