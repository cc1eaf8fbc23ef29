//! The per-job unit of work and the polling worker loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use solrep_core::{
    check_prerequisites, ready_dependents, Job, PipelineError, Report, SectionName,
    SectionStatus,
};
use solrep_model::{ModelInvoker, ModelRequest, ValidatedSection};
use solrep_storage::{ObjectStore, SectionStore, StoreError};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SectionCatalog;
use crate::dispatch::Dispatcher;
use crate::prompt::build_user_prompt;
use crate::queue::{JobQueue, QueueError, QueueMessage};
use crate::source::{load_source_text, SourceTextLimits};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub model_id: String,
    pub source_limits: SourceTextLimits,
    pub auto_dispatch: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// The section already holds a result for the job's inputs.
    AlreadyComplete,
    /// The report's inputs changed after the job was dispatched.
    Stale,
    /// Sequencing error; the job is dropped. The only write is releasing the
    /// IN_PROGRESS mark its own dispatch left on the section.
    Rejected(PipelineError),
    /// Recorded as FAILED on the section; the queue should redeliver.
    Failed(PipelineError),
}

impl JobOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed_message_ids: Vec<String>,
    /// Messages whose ack or fail call errored; they stay leased until the
    /// visibility timeout.
    pub unreported_message_ids: Vec<String>,
}

#[derive(Clone)]
pub struct SectionWorker {
    store: SectionStore,
    objects: Arc<dyn ObjectStore>,
    invoker: ModelInvoker,
    catalog: Arc<SectionCatalog>,
    settings: WorkerSettings,
    dispatcher: Option<Dispatcher>,
}

impl SectionWorker {
    pub fn new(
        store: SectionStore,
        objects: Arc<dyn ObjectStore>,
        invoker: ModelInvoker,
        catalog: SectionCatalog,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            objects,
            invoker,
            catalog: Arc::new(catalog),
            settings,
            dispatcher: None,
        }
    }

    /// Enables dispatching dependents that a completed section unblocks.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub async fn process_job(&self, job: &Job) -> JobOutcome {
        let span = info_span!(
            "section_job",
            report_id = %job.report_id,
            section = %job.section,
            force = job.force
        );
        self.run_job(job).instrument(span).await
    }

    async fn run_job(&self, job: &Job) -> JobOutcome {
        let report_id = job.report_id.as_str();
        let section = job.section;

        let report = match self.store.require_report(report_id).await {
            Ok(report) => report,
            Err(err) => return self.store_failure(report_id, section, err).await,
        };

        let current_hash = report.input_hash(section);
        if job.input_hash != current_hash {
            info!("dropping stale job; inputs changed since dispatch");
            return JobOutcome::Stale;
        }
        if !job.force
            && report
                .section(section)
                .is_some_and(|record| record.is_satisfied_by(&current_hash))
        {
            info!("section already complete for these inputs; skipping");
            return JobOutcome::AlreadyComplete;
        }

        if let Err(err) = check_prerequisites(&report, section) {
            warn!(error = %err, "rejecting job");
            let dispatched_mark = report.section(section).is_some_and(|record| {
                record.status == SectionStatus::InProgress
                    && record.input_hash.as_deref() == Some(current_hash.as_str())
            });
            if dispatched_mark {
                if let Err(store_err) = self.store.mark_idle(report_id, section).await {
                    error!(error = %store_err, "could not release in-progress mark");
                }
            }
            return JobOutcome::Rejected(err);
        }

        if let Err(err) = self
            .store
            .mark_in_progress(report_id, section, &current_hash)
            .await
        {
            return self.store_failure(report_id, section, err).await;
        }

        let validated = match self.compute(&report, section).await {
            Ok(validated) => validated,
            Err(err) => return self.fail(report_id, section, err).await,
        };

        if let Err(err) = self
            .store
            .mark_complete(
                report_id,
                section,
                validated.data,
                validated.top_level.as_ref(),
            )
            .await
        {
            return self.store_failure(report_id, section, err).await;
        }
        info!("section complete");

        if self.settings.auto_dispatch {
            self.unblock_dependents(report_id, section).await;
        }
        JobOutcome::Completed
    }

    async fn compute(
        &self,
        report: &Report,
        section: SectionName,
    ) -> Result<ValidatedSection, PipelineError> {
        let source =
            load_source_text(self.objects.as_ref(), report, self.settings.source_limits).await?;
        let settings = self.catalog.settings(section);
        let request = ModelRequest {
            model_id: self.settings.model_id.clone(),
            system: settings.system,
            user: build_user_prompt(section, report, &source),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        };
        debug!(
            prompt_chars = request.user.chars().count(),
            max_tokens = request.max_tokens,
            "invoking model"
        );
        self.invoker.invoke_section(section, request).await
    }

    async fn unblock_dependents(&self, report_id: &str, completed: SectionName) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let report = match self.store.require_report(report_id).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "could not reload report to check dependents");
                return;
            }
        };
        for dependent in ready_dependents(&report, completed) {
            match dispatcher.dispatch(report_id, dependent, false).await {
                Ok(outcome) => info!(%dependent, enqueued = outcome.enqueued, "dispatched dependent section"),
                Err(err) => warn!(%dependent, error = %err, "dependent dispatch failed"),
            }
        }
    }

    async fn store_failure(
        &self,
        report_id: &str,
        section: SectionName,
        err: StoreError,
    ) -> JobOutcome {
        match PipelineError::from(err) {
            err @ PipelineError::ReportNotFound { .. } => {
                warn!(error = %err, "rejecting job");
                JobOutcome::Rejected(err)
            }
            err => self.fail(report_id, section, err).await,
        }
    }

    async fn fail(&self, report_id: &str, section: SectionName, err: PipelineError) -> JobOutcome {
        warn!(kind = err.kind(), error = %err, "section failed");
        if let Err(store_err) = self.store.mark_failed(report_id, section, &err).await {
            error!(error = %store_err, "could not record section failure");
        }
        JobOutcome::Failed(err)
    }

    /// Runs every message of a batch concurrently; one failure never affects its siblings.
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> Vec<(String, JobOutcome)> {
        let handles: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let QueueMessage {
                    message_id,
                    receive_count,
                    job,
                } = message;
                let worker = self.clone();
                let span = info_span!("queue_message", %message_id, receive_count);
                let handle =
                    tokio::spawn(async move { worker.process_job(&job).await }.instrument(span));
                (message_id, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (message_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(%message_id, error = %join_err, "section job task aborted");
                    JobOutcome::Failed(PipelineError::ModelInvocationFailed(format!(
                        "worker task aborted: {join_err}"
                    )))
                }
            };
            outcomes.push((message_id, outcome));
        }
        outcomes
    }

    /// Receives one batch, processes it, and reports each message back to the queue.
    pub async fn drain_once(
        &self,
        queue: &dyn JobQueue,
        max: usize,
    ) -> Result<BatchReport, QueueError> {
        let messages = queue.receive_batch(max).await?;
        let mut report = BatchReport {
            processed: messages.len(),
            ..BatchReport::default()
        };
        for (message_id, outcome) in self.process_batch(messages).await {
            let reported = match &outcome {
                JobOutcome::Failed(err) => {
                    report.failed_message_ids.push(message_id.clone());
                    queue.fail(&message_id, &err.failure_message()).await
                }
                _ => queue.ack(&message_id).await,
            };
            if let Err(err) = reported {
                error!(%message_id, error = %err, "could not report message outcome");
                report.unreported_message_ids.push(message_id);
            }
        }
        Ok(report)
    }
}

/// Polls `queue` until `shutdown` resolves, sleeping `poll` whenever it is empty.
pub async fn run_worker_loop(
    worker: SectionWorker,
    queue: Arc<dyn JobQueue>,
    batch_size: usize,
    poll: Duration,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    info!(batch_size, poll_ms = poll.as_millis() as u64, "worker started");
    loop {
        let idle = tokio::select! {
            _ = &mut shutdown => break,
            drained = worker.drain_once(queue.as_ref(), batch_size.max(1)) => match drained {
                Ok(report) => {
                    if report.processed > 0 {
                        info!(
                            processed = report.processed,
                            failed = report.failed_message_ids.len(),
                            unreported = report.unreported_message_ids.len(),
                            "batch finished"
                        );
                    }
                    report.processed == 0
                }
                Err(err) => {
                    error!(error = %err, "queue error");
                    true
                }
            },
        };
        if idle {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
    info!("worker stopped");
}
