//! Section dispatch: pre-flight checks, IN_PROGRESS transition, enqueue.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use solrep_core::{check_prerequisites, Job, PipelineError, SectionName, SectionStatus};
use solrep_storage::SectionStore;
use tracing::{info, warn};

use crate::queue::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub status: SectionStatus,
    pub enqueued: bool,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: SectionStore,
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(store: SectionStore, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    pub fn store(&self) -> &SectionStore {
        &self.store
    }

    /// Marks `section` IN_PROGRESS for the report's current inputs and enqueues a job.
    ///
    /// A section already COMPLETE for the current input hash is left alone unless
    /// `force` is set. Unmet prerequisites are reported before any state change.
    pub async fn dispatch(
        &self,
        report_id: &str,
        section: SectionName,
        force: bool,
    ) -> Result<DispatchOutcome, PipelineError> {
        let report = self.store.require_report(report_id).await?;
        let input_hash = report.input_hash(section);

        if !force
            && report
                .section(section)
                .is_some_and(|record| record.is_satisfied_by(&input_hash))
        {
            info!(report_id, %section, "section already complete for current inputs");
            return Ok(DispatchOutcome {
                status: SectionStatus::Complete,
                enqueued: false,
            });
        }

        check_prerequisites(&report, section)?;

        self.store
            .mark_in_progress(report_id, section, &input_hash)
            .await?;

        let job = Job {
            report_id: report_id.to_string(),
            section,
            input_hash,
            dispatched_at: Utc::now(),
            force,
        };
        match self.queue.enqueue(&job).await {
            Ok(message_id) => {
                info!(report_id, %section, %message_id, force, "section job enqueued");
                Ok(DispatchOutcome {
                    status: SectionStatus::InProgress,
                    enqueued: true,
                })
            }
            Err(err) => {
                let err = PipelineError::from(err);
                warn!(report_id, %section, error = %err, "enqueue failed");
                if let Err(store_err) = self.store.mark_failed(report_id, section, &err).await {
                    warn!(report_id, %section, error = %store_err, "could not record enqueue failure");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryQueue, QueueError, QueueMessage};
    use async_trait::async_trait;
    use serde_json::json;
    use solrep_core::Report;

    async fn setup() -> (Dispatcher, Arc<MemoryQueue>) {
        let store = SectionStore::in_memory();
        store
            .create_report(&Report::new(
                "rep-1",
                "proj-1",
                "opp-1",
                vec!["sources/rfp.txt".into()],
                Utc::now(),
            ))
            .await
            .unwrap();
        let queue = Arc::new(MemoryQueue::default());
        (Dispatcher::new(store, queue.clone()), queue)
    }

    #[tokio::test]
    async fn dispatch_marks_in_progress_and_enqueues() {
        let (dispatcher, queue) = setup().await;
        let outcome = dispatcher
            .dispatch("rep-1", SectionName::Risks, false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome {
                status: SectionStatus::InProgress,
                enqueued: true
            }
        );

        let report = dispatcher.store().require_report("rep-1").await.unwrap();
        let record = report.section(SectionName::Risks).unwrap();
        assert_eq!(record.status, SectionStatus::InProgress);
        assert_eq!(
            record.input_hash.as_deref(),
            Some(report.input_hash(SectionName::Risks).as_str())
        );

        let jobs = queue.pending_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].input_hash, report.input_hash(SectionName::Risks));
    }

    #[tokio::test]
    async fn missing_report_is_rejected() {
        let (dispatcher, queue) = setup().await;
        let err = dispatcher
            .dispatch("nope", SectionName::Summary, false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::ReportNotFound {
                report_id: "nope".into()
            }
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn scoring_gate_leaves_report_untouched() {
        let (dispatcher, queue) = setup().await;
        let before = dispatcher.store().require_report("rep-1").await.unwrap();
        let err = dispatcher
            .dispatch("rep-1", SectionName::Scoring, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PrerequisitesNotMet");
        assert_eq!(
            dispatcher.store().require_report("rep-1").await.unwrap(),
            before
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn complete_section_short_circuits_unless_forced() {
        let (dispatcher, queue) = setup().await;
        let store = dispatcher.store().clone();
        let hash = store
            .require_report("rep-1")
            .await
            .unwrap()
            .input_hash(SectionName::Summary);
        store
            .mark_in_progress("rep-1", SectionName::Summary, &hash)
            .await
            .unwrap();
        store
            .mark_complete("rep-1", SectionName::Summary, json!({"overview": "x"}), None)
            .await
            .unwrap();

        let outcome = dispatcher
            .dispatch("rep-1", SectionName::Summary, false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome {
                status: SectionStatus::Complete,
                enqueued: false
            }
        );
        assert!(queue.is_empty().await);

        let forced = dispatcher
            .dispatch("rep-1", SectionName::Summary, true)
            .await
            .unwrap();
        assert!(forced.enqueued);
        assert!(queue.pending_jobs().await[0].force);
    }

    struct BrokenQueue;

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, _job: &Job) -> Result<String, QueueError> {
            Err(QueueError::UnknownMessage("queue offline".into()))
        }
        async fn receive_batch(&self, _max: usize) -> Result<Vec<QueueMessage>, QueueError> {
            Ok(Vec::new())
        }
        async fn ack(&self, _message_id: &str) -> Result<(), QueueError> {
            Ok(())
        }
        async fn fail(&self, _message_id: &str, _reason: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_failure_is_recorded_on_the_section() {
        let (dispatcher, _) = setup().await;
        let dispatcher = Dispatcher::new(dispatcher.store().clone(), Arc::new(BrokenQueue));
        let err = dispatcher
            .dispatch("rep-1", SectionName::Contacts, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueueError");
        let report = dispatcher.store().require_report("rep-1").await.unwrap();
        let record = report.section(SectionName::Contacts).unwrap();
        assert_eq!(record.status, SectionStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("QueueError: unknown message queue offline")
        );
    }
}
