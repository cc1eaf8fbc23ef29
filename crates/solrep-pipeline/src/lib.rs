//! Section pipeline orchestration: dispatch, queueing, and section workers.

use std::sync::Arc;

use anyhow::{Context, Result};
use solrep_model::{HttpModelClient, HttpModelConfig, ModelClient, ModelInvoker};
use solrep_storage::{FsObjectStore, ObjectStore, PgDocumentStore, SectionStore};
use sqlx::PgPool;
use tracing::info;

pub mod config;
pub mod dispatch;
pub mod prompt;
pub mod queue;
pub mod source;
pub mod worker;

pub use config::{PipelineConfig, SectionCatalog, SectionSettings};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use queue::{JobQueue, MemoryQueue, PgQueue, QueueError, QueueMessage};
pub use source::{load_source_text, SourceText, SourceTextLimits};
pub use worker::{run_worker_loop, BatchReport, JobOutcome, SectionWorker, WorkerSettings};

pub const CRATE_NAME: &str = "solrep-pipeline";

/// Backends selected from configuration: Postgres when `DATABASE_URL` is set,
/// in-memory otherwise.
#[derive(Clone)]
pub struct PipelineServices {
    pub config: PipelineConfig,
    pub store: SectionStore,
    pub objects: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn JobQueue>,
    pub dispatcher: Dispatcher,
    pool: Option<PgPool>,
}

impl PipelineServices {
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.objects_dir.clone()));
        let (store, queue, pool): (SectionStore, Arc<dyn JobQueue>, Option<PgPool>) =
            match &config.database_url {
                Some(url) => {
                    let docs = PgDocumentStore::connect(url, 10)
                        .await
                        .context("connecting to postgres")?;
                    let pool = docs.pool().clone();
                    let queue = PgQueue::new(pool.clone(), config.visibility_timeout());
                    (SectionStore::new(Arc::new(docs)), Arc::new(queue), Some(pool))
                }
                None => {
                    info!("DATABASE_URL not set; using in-memory report store and queue");
                    (
                        SectionStore::in_memory(),
                        Arc::new(MemoryQueue::new(config.visibility_timeout())),
                        None,
                    )
                }
            };
        let dispatcher = Dispatcher::new(store.clone(), queue.clone());
        Ok(Self {
            config,
            store,
            objects,
            queue,
            dispatcher,
            pool,
        })
    }

    pub async fn connect_from_env() -> Result<Self> {
        Self::connect(PipelineConfig::from_env()).await
    }

    /// Creates the `reports` and `section_jobs` tables. A no-op for in-memory backends.
    pub async fn migrate(&self) -> Result<()> {
        let Some(pool) = &self.pool else {
            info!("in-memory backends need no migration");
            return Ok(());
        };
        PgDocumentStore::new(pool.clone())
            .migrate()
            .await
            .context("creating reports table")?;
        PgQueue::new(pool.clone(), self.config.visibility_timeout())
            .migrate()
            .await
            .context("creating section_jobs table")?;
        info!("migrations applied");
        Ok(())
    }

    /// A worker calling the configured HTTP model endpoint.
    pub async fn worker(&self) -> Result<SectionWorker> {
        let client = HttpModelClient::new(HttpModelConfig {
            endpoint: self.config.model_endpoint.clone(),
            api_key: self.config.model_api_key.clone(),
            timeout: self.config.model_timeout(),
            concurrency: self.config.worker_batch_size.max(1),
            ..Default::default()
        })
        .context("building model client")?;
        let catalog = SectionCatalog::load(self.config.sections_file.as_deref()).await?;
        Ok(self.worker_with_client(Arc::new(client), catalog))
    }

    pub fn worker_with_client(
        &self,
        client: Arc<dyn ModelClient>,
        catalog: SectionCatalog,
    ) -> SectionWorker {
        SectionWorker::new(
            self.store.clone(),
            self.objects.clone(),
            ModelInvoker::new(client),
            catalog,
            WorkerSettings {
                model_id: self.config.model_id.clone(),
                source_limits: self.config.source_limits(),
                auto_dispatch: self.config.auto_dispatch,
            },
        )
        .with_dispatcher(self.dispatcher.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use solrep_core::{Report, SectionName, SectionStatus};
    use solrep_model::ScriptedModelClient;

    #[tokio::test]
    async fn in_memory_services_run_a_section_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            objects_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let services = PipelineServices::connect(config).await.unwrap();
        services.migrate().await.unwrap();

        let stored = services
            .objects
            .put_text("sources", "txt", &"Statement of work for grounds maintenance. ".repeat(5))
            .await
            .unwrap();
        services
            .store
            .create_report(&Report::new("rep-9", "proj", "opp", vec![stored.key], Utc::now()))
            .await
            .unwrap();

        let outcome = services
            .dispatcher
            .dispatch("rep-9", SectionName::Summary, false)
            .await
            .unwrap();
        assert!(outcome.enqueued);

        let client = Arc::new(ScriptedModelClient::always(r#"{"overview": "Grounds maintenance"}"#));
        let worker = services.worker_with_client(client, SectionCatalog::builtin());
        let batch = worker
            .drain_once(services.queue.as_ref(), services.config.worker_batch_size)
            .await
            .unwrap();
        assert_eq!(batch.processed, 1);
        assert!(batch.failed_message_ids.is_empty());

        let report = services.store.require_report("rep-9").await.unwrap();
        assert_eq!(
            report.section_status(SectionName::Summary),
            SectionStatus::Complete
        );
        assert_eq!(report.overall_status(), SectionStatus::Idle);
    }
}
