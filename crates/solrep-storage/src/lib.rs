//! Report document persistence, section state transitions, and object storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use solrep_core::{
    format_failure, PipelineError, Report, SectionName, SectionRecord, SectionStatus,
    TopLevelPatch,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub mod objects;
pub mod postgres;
pub mod update;

pub use objects::{FsObjectStore, MemoryObjectStore, ObjectStore, StoredObject};
pub use postgres::PgDocumentStore;
pub use update::{Scope, UpdateBuilder, UpdateClause, UpdateDescriptor, UpdateOp};

pub const CRATE_NAME: &str = "solrep-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("report {report_id} not found")]
    ReportNotFound { report_id: String },
    #[error("report {report_id} already exists")]
    AlreadyExists { report_id: String },
    #[error("object {key} not found")]
    ObjectNotFound { key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("invalid report document: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ReportNotFound { report_id } => PipelineError::ReportNotFound { report_id },
            other => PipelineError::Storage(other.to_string()),
        }
    }
}

/// Keyed JSON documents with conditional, atomic partial updates.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, report_id: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn insert(&self, report_id: &str, doc: JsonValue) -> Result<(), StoreError>;

    /// Applies `update` as one atomic operation; fails with `ReportNotFound` when
    /// the document does not exist.
    async fn update(&self, report_id: &str, update: &UpdateDescriptor) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<String, JsonValue>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, report_id: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.docs.read().await.get(report_id).cloned())
    }

    async fn insert(&self, report_id: &str, doc: JsonValue) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(report_id) {
            return Err(StoreError::AlreadyExists {
                report_id: report_id.to_string(),
            });
        }
        docs.insert(report_id.to_string(), doc);
        Ok(())
    }

    async fn update(&self, report_id: &str, update: &UpdateDescriptor) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(report_id)
            .ok_or_else(|| StoreError::ReportNotFound {
                report_id: report_id.to_string(),
            })?;
        // Apply to a copy so a failing clause leaves the stored document untouched.
        let mut next = doc.clone();
        update.apply(&mut next)?;
        *doc = next;
        Ok(())
    }
}

/// The named section state transitions over a report document.
#[derive(Clone)]
pub struct SectionStore {
    docs: Arc<dyn DocumentStore>,
}

impl SectionStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDocumentStore::new()))
    }

    pub async fn create_report(&self, report: &Report) -> Result<(), StoreError> {
        let doc = serde_json::to_value(report)?;
        self.docs.insert(&report.id, doc).await
    }

    pub async fn load_report(&self, report_id: &str) -> Result<Option<Report>, StoreError> {
        match self.docs.get(report_id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn require_report(&self, report_id: &str) -> Result<Report, StoreError> {
        self.load_report(report_id)
            .await?
            .ok_or_else(|| StoreError::ReportNotFound {
                report_id: report_id.to_string(),
            })
    }

    /// Creates an IDLE record for `section` unless one already exists.
    pub async fn ensure_section(
        &self,
        report_id: &str,
        section: SectionName,
    ) -> Result<(), StoreError> {
        let record = serde_json::to_value(SectionRecord::idle(Utc::now()))?;
        let update = UpdateBuilder::new()
            .init_section_if_absent(section, record)
            .build();
        self.apply(report_id, section, &update).await
    }

    pub async fn mark_in_progress(
        &self,
        report_id: &str,
        section: SectionName,
        input_hash: &str,
    ) -> Result<(), StoreError> {
        let update = UpdateBuilder::new()
            .set_section(section, "status", json!(SectionStatus::InProgress.as_str()))
            .set_section(section, "inputHash", json!(input_hash))
            .set_section(section, "updatedAt", json!(Utc::now()))
            .build();
        self.apply(report_id, section, &update).await
    }

    /// Stores `data` and, in the same operation, any top-level aggregate fields.
    pub async fn mark_complete(
        &self,
        report_id: &str,
        section: SectionName,
        data: JsonValue,
        top_level: Option<&TopLevelPatch>,
    ) -> Result<(), StoreError> {
        let now = json!(Utc::now());
        let mut builder = UpdateBuilder::new()
            .set_section(section, "status", json!(SectionStatus::Complete.as_str()))
            .set_section(section, "data", data)
            .remove_section(section, "error")
            .set_section(section, "updatedAt", now.clone());
        if let Some(patch) = top_level.filter(|patch| !patch.is_empty()) {
            for (attribute, value) in patch.fields() {
                builder = builder.set_report(attribute, value);
            }
            builder = builder.set_report("updatedAt", now);
        }
        self.apply(report_id, section, &builder.build()).await
    }

    /// Returns an IN_PROGRESS section to IDLE, keeping its last data and hash.
    pub async fn mark_idle(&self, report_id: &str, section: SectionName) -> Result<(), StoreError> {
        let update = UpdateBuilder::new()
            .set_section(section, "status", json!(SectionStatus::Idle.as_str()))
            .set_section(section, "updatedAt", json!(Utc::now()))
            .build();
        self.apply(report_id, section, &update).await
    }

    pub async fn mark_failed(
        &self,
        report_id: &str,
        section: SectionName,
        error: &(dyn std::error::Error + Send + Sync + 'static),
    ) -> Result<(), StoreError> {
        let update = UpdateBuilder::new()
            .set_section(section, "status", json!(SectionStatus::Failed.as_str()))
            .set_section(section, "error", json!(format_failure(error)))
            .remove_section(section, "data")
            .set_section(section, "updatedAt", json!(Utc::now()))
            .build();
        self.apply(report_id, section, &update).await
    }

    async fn apply(
        &self,
        report_id: &str,
        section: SectionName,
        update: &UpdateDescriptor,
    ) -> Result<(), StoreError> {
        debug!(
            report_id,
            %section,
            expression = %update.expression(),
            "applying section update"
        );
        self.docs.update(report_id, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seeded() -> SectionStore {
        let store = SectionStore::in_memory();
        let report = Report::new("r-1", "p-1", "o-1", vec!["src/a.txt".into()], Utc::now());
        store.create_report(&report).await.expect("create");
        store
    }

    #[tokio::test]
    async fn ensure_section_is_idempotent() {
        let store = seeded().await;
        store.ensure_section("r-1", SectionName::Summary).await.unwrap();
        let once = store.require_report("r-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.ensure_section("r-1", SectionName::Summary).await.unwrap();
        let twice = store.require_report("r-1").await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.section_status(SectionName::Summary), SectionStatus::Idle);
    }

    #[tokio::test]
    async fn ensure_section_keeps_existing_record() {
        let store = seeded().await;
        store
            .mark_complete("r-1", SectionName::Risks, json!({"risks": []}), None)
            .await
            .unwrap();
        store.ensure_section("r-1", SectionName::Risks).await.unwrap();
        let report = store.require_report("r-1").await.unwrap();
        assert_eq!(report.section_status(SectionName::Risks), SectionStatus::Complete);
    }

    #[tokio::test]
    async fn mark_in_progress_requires_report() {
        let store = seeded().await;
        let err = store
            .mark_in_progress("missing", SectionName::Summary, "h")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReportNotFound { .. }));
        assert!(matches!(
            PipelineError::from(err),
            PipelineError::ReportNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn mark_in_progress_is_repeatable() {
        let store = seeded().await;
        for _ in 0..3 {
            store
                .mark_in_progress("r-1", SectionName::Deadlines, "h1")
                .await
                .unwrap();
        }
        let report = store.require_report("r-1").await.unwrap();
        let record = report.section(SectionName::Deadlines).unwrap();
        assert_eq!(record.status, SectionStatus::InProgress);
        assert_eq!(record.input_hash.as_deref(), Some("h1"));
        assert!(record.updated_at.is_some());
    }

    #[tokio::test]
    async fn mark_idle_releases_in_progress_section() {
        let store = seeded().await;
        store
            .mark_in_progress("r-1", SectionName::Scoring, "h1")
            .await
            .unwrap();
        store.mark_idle("r-1", SectionName::Scoring).await.unwrap();
        let report = store.require_report("r-1").await.unwrap();
        let record = report.section(SectionName::Scoring).unwrap();
        assert_eq!(record.status, SectionStatus::Idle);
        assert_eq!(record.input_hash.as_deref(), Some("h1"));
        assert_eq!(report.overall_status(), SectionStatus::Idle);
    }

    #[tokio::test]
    async fn complete_clears_error_and_failed_clears_data() {
        let store = seeded().await;
        let failure = PipelineError::ModelInvocationFailed("endpoint returned 503".into());
        store
            .mark_failed("r-1", SectionName::Contacts, &failure)
            .await
            .unwrap();
        let report = store.require_report("r-1").await.unwrap();
        let record = report.section(SectionName::Contacts).unwrap();
        assert_eq!(record.status, SectionStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("ModelInvocationFailed: endpoint returned 503")
        );

        store
            .mark_complete("r-1", SectionName::Contacts, json!({"contacts": []}), None)
            .await
            .unwrap();
        let record = store.require_report("r-1").await.unwrap().sections[&SectionName::Contacts].clone();
        assert_eq!(record.status, SectionStatus::Complete);
        assert!(record.error.is_none());
        assert_eq!(record.data, Some(json!({"contacts": []})));

        store
            .mark_failed("r-1", SectionName::Contacts, &failure)
            .await
            .unwrap();
        let record = store.require_report("r-1").await.unwrap().sections[&SectionName::Contacts].clone();
        assert!(record.data.is_none());
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn mark_complete_with_patch_writes_aggregates() {
        let store = seeded().await;
        let patch = TopLevelPatch {
            composite_score: Some(77.0),
            recommendation: Some("Pursue".into()),
            decision: Some("BID".into()),
            confidence: Some(0.8),
            status: Some(SectionStatus::Complete),
        };
        store
            .mark_complete("r-1", SectionName::Scoring, json!({"compositeScore": 77.0}), Some(&patch))
            .await
            .unwrap();
        let report = store.require_report("r-1").await.unwrap();
        assert_eq!(report.composite_score, Some(77.0));
        assert_eq!(report.decision.as_deref(), Some("BID"));
        assert_eq!(report.status, Some(SectionStatus::Complete));
        assert_eq!(report.section_status(SectionName::Scoring), SectionStatus::Complete);
        assert_eq!(
            report.updated_at,
            report.sections[&SectionName::Scoring].updated_at
        );
    }

    #[tokio::test]
    async fn concurrent_reader_never_sees_complete_without_aggregates() {
        let store = seeded().await;
        let reader_store = store.clone();
        let reader = tokio::spawn(async move {
            for _ in 0..500 {
                let report = reader_store.require_report("r-1").await.unwrap();
                if report.section_status(SectionName::Scoring) == SectionStatus::Complete {
                    assert_eq!(report.composite_score, Some(64.0));
                    assert_eq!(report.decision.as_deref(), Some("NO_BID"));
                }
                tokio::task::yield_now().await;
            }
        });
        let patch = TopLevelPatch {
            composite_score: Some(64.0),
            decision: Some("NO_BID".into()),
            ..Default::default()
        };
        tokio::task::yield_now().await;
        store
            .mark_complete("r-1", SectionName::Scoring, json!({}), Some(&patch))
            .await
            .unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn failed_update_leaves_document_untouched() {
        let docs = Arc::new(MemoryDocumentStore::new());
        docs.insert("r-2", json!({"id": "r-2", "sections": "corrupt"}))
            .await
            .unwrap();
        let store = SectionStore::new(docs.clone());
        let err = store
            .mark_in_progress("r-2", SectionName::Summary, "h")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)));
        assert_eq!(
            docs.get("r-2").await.unwrap(),
            Some(json!({"id": "r-2", "sections": "corrupt"}))
        );
    }
}
