//! At-least-once section job queue with visibility timeouts.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use solrep_core::{Job, PipelineError};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Deliveries after which a failing message is parked instead of redelivered.
pub const DEFAULT_MAX_RECEIVES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receive_count: u32,
    pub job: Job,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        PipelineError::Queue(err.to_string())
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns the message id of the enqueued job.
    async fn enqueue(&self, job: &Job) -> Result<String, QueueError>;
    /// Leases up to `max` visible messages for one visibility timeout.
    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError>;
    async fn ack(&self, message_id: &str) -> Result<(), QueueError>;
    /// Reports a failed delivery; the message is redelivered once a fresh
    /// visibility timeout has elapsed.
    async fn fail(&self, message_id: &str, reason: &str) -> Result<(), QueueError>;
}

#[derive(Debug)]
struct Entry {
    message_id: String,
    job: Job,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    next_seq: u64,
    entries: BTreeMap<u64, Entry>,
    dead_letters: Vec<(Job, String)>,
}

#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    visibility_timeout: Duration,
    max_receives: u32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(900))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            visibility_timeout,
            max_receives: DEFAULT_MAX_RECEIVES,
        }
    }

    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = max_receives.max(1);
        self
    }

    /// Messages not yet acknowledged, leased or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn pending_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        state.entries.values().map(|entry| entry.job.clone()).collect()
    }

    pub async fn dead_letters(&self) -> Vec<(Job, String)> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<String, QueueError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        let message_id = Uuid::new_v4().to_string();
        state.entries.insert(
            seq,
            Entry {
                message_id: message_id.clone(),
                job: job.clone(),
                receive_count: 0,
                visible_at: Instant::now(),
            },
        );
        Ok(message_id)
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let batch = state
            .entries
            .values_mut()
            .filter(|entry| entry.visible_at <= now)
            .take(max)
            .map(|entry| {
                entry.receive_count += 1;
                entry.visible_at = now + self.visibility_timeout;
                QueueMessage {
                    message_id: entry.message_id.clone(),
                    receive_count: entry.receive_count,
                    job: entry.job.clone(),
                }
            })
            .collect();
        Ok(batch)
    }

    async fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let seq = find_seq(&state, message_id)?;
        state.entries.remove(&seq);
        Ok(())
    }

    async fn fail(&self, message_id: &str, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let seq = find_seq(&state, message_id)?;
        let exhausted = state
            .entries
            .get(&seq)
            .is_some_and(|entry| entry.receive_count >= self.max_receives);
        if exhausted {
            if let Some(entry) = state.entries.remove(&seq) {
                warn!(message_id, receives = entry.receive_count, "parking message after repeated failures");
                state.dead_letters.push((entry.job, reason.to_string()));
            }
        } else if let Some(entry) = state.entries.get_mut(&seq) {
            entry.visible_at = Instant::now() + self.visibility_timeout;
        }
        Ok(())
    }
}

fn find_seq(state: &MemoryQueueState, message_id: &str) -> Result<u64, QueueError> {
    state
        .entries
        .iter()
        .find(|(_, entry)| entry.message_id == message_id)
        .map(|(seq, _)| *seq)
        .ok_or_else(|| QueueError::UnknownMessage(message_id.to_string()))
}

const CREATE_SECTION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS section_jobs (
    id             BIGSERIAL PRIMARY KEY,
    report_id      TEXT NOT NULL,
    section        TEXT NOT NULL,
    payload        JSONB NOT NULL,
    receive_count  INTEGER NOT NULL DEFAULT 0,
    visible_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    dead           BOOLEAN NOT NULL DEFAULT FALSE,
    last_error     TEXT,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_SECTION_JOBS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS section_jobs_visible_idx
    ON section_jobs (visible_at)
    WHERE NOT dead
"#;

/// Postgres table queue leased with `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    max_receives: u32,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            max_receives: DEFAULT_MAX_RECEIVES,
        }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(CREATE_SECTION_JOBS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_SECTION_JOBS_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn park(&self, id: i64, reason: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE section_jobs SET dead = TRUE, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Splits leased rows into deliverable messages and rows whose payload is not a job.
fn partition_leased(rows: Vec<(i64, i32, JsonValue)>) -> (Vec<QueueMessage>, Vec<(i64, String)>) {
    let mut messages = Vec::with_capacity(rows.len());
    let mut undecodable = Vec::new();
    for (id, receive_count, payload) in rows {
        match serde_json::from_value::<Job>(payload) {
            Ok(job) => messages.push(QueueMessage {
                message_id: id.to_string(),
                receive_count: u32::try_from(receive_count).unwrap_or_default(),
                job,
            }),
            Err(err) => undecodable.push((id, format!("undecodable job payload: {err}"))),
        }
    }
    (messages, undecodable)
}

fn parse_message_id(message_id: &str) -> Result<i64, QueueError> {
    message_id
        .parse()
        .map_err(|_| QueueError::UnknownMessage(message_id.to_string()))
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, job: &Job) -> Result<String, QueueError> {
        let payload = serde_json::to_value(job)?;
        let row = sqlx::query(
            r#"
            INSERT INTO section_jobs (report_id, section, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&job.report_id)
        .bind(job.section.as_str())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        Ok(id.to_string())
    }

    async fn receive_batch(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE section_jobs
               SET receive_count = receive_count + 1,
                   visible_at = NOW() + make_interval(secs => $2)
             WHERE id IN (
                   SELECT id FROM section_jobs
                    WHERE NOT dead AND visible_at <= NOW()
                    ORDER BY id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED)
            RETURNING id, receive_count, payload
            "#,
        )
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            leased.push((
                row.try_get::<i64, _>("id")?,
                row.try_get::<i32, _>("receive_count")?,
                row.try_get::<JsonValue, _>("payload")?,
            ));
        }
        let (mut messages, undecodable) = partition_leased(leased);
        for (id, reason) in undecodable {
            warn!(message_id = id, error = %reason, "parking undecodable message");
            if let Err(err) = self.park(id, &reason).await {
                warn!(message_id = id, error = %err, "could not park undecodable message");
            }
        }
        messages.sort_by_key(|m| parse_message_id(&m.message_id).unwrap_or_default());
        Ok(messages)
    }

    async fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM section_jobs WHERE id = $1")
            .bind(parse_message_id(message_id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, message_id: &str, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE section_jobs
               SET visible_at = NOW() + make_interval(secs => $4),
                   last_error = $2,
                   dead = receive_count >= $3
             WHERE id = $1
            "#,
        )
        .bind(parse_message_id(message_id)?)
        .bind(reason)
        .bind(i32::try_from(self.max_receives).unwrap_or(i32::MAX))
        .bind(self.visibility_timeout.as_secs_f64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownMessage(message_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use solrep_core::SectionName;

    fn job(section: SectionName) -> Job {
        Job {
            report_id: "rep-1".into(),
            section,
            input_hash: "h".into(),
            dispatched_at: Utc::now(),
            force: false,
        }
    }

    #[tokio::test]
    async fn leased_messages_are_invisible_until_timeout() {
        let queue = MemoryQueue::new(Duration::from_millis(40));
        queue.enqueue(&job(SectionName::Summary)).await.unwrap();
        queue.enqueue(&job(SectionName::Risks)).await.unwrap();

        let first = queue.receive_batch(10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].job.section, SectionName::Summary);
        assert!(queue.receive_batch(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let redelivered = queue.receive_batch(1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
        assert_eq!(redelivered[0].message_id, first[0].message_id);
    }

    #[tokio::test]
    async fn ack_removes_and_fail_redelivers_after_timeout() {
        let queue = MemoryQueue::new(Duration::from_millis(40));
        queue.enqueue(&job(SectionName::Summary)).await.unwrap();
        queue.enqueue(&job(SectionName::Contacts)).await.unwrap();
        let batch = queue.receive_batch(10).await.unwrap();

        queue.ack(&batch[0].message_id).await.unwrap();
        queue.fail(&batch[1].message_id, "boom").await.unwrap();
        assert_eq!(queue.len().await, 1);
        assert!(queue.receive_batch(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = queue.receive_batch(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].job.section, SectionName::Contacts);
        assert_eq!(again[0].receive_count, 2);

        assert!(matches!(
            queue.ack("no-such-message").await,
            Err(QueueError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn repeated_failures_are_parked() {
        let queue = MemoryQueue::new(Duration::ZERO).with_max_receives(2);
        queue.enqueue(&job(SectionName::Scoring)).await.unwrap();
        for _ in 0..2 {
            let batch = queue.receive_batch(1).await.unwrap();
            queue.fail(&batch[0].message_id, "ModelOutputNotJSON: nope").await.unwrap();
        }
        assert!(queue.is_empty().await);
        let parked = queue.dead_letters().await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].1, "ModelOutputNotJSON: nope");
    }

    #[test]
    fn undecodable_rows_are_split_from_the_batch() {
        let good = serde_json::to_value(job(SectionName::Deadlines)).unwrap();
        let (messages, undecodable) = partition_leased(vec![
            (7, 3, serde_json::json!({"section": "pricing"})),
            (8, 1, good),
        ]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, "8");
        assert_eq!(messages[0].job.section, SectionName::Deadlines);
        assert_eq!(undecodable.len(), 1);
        assert_eq!(undecodable[0].0, 7);
        assert!(undecodable[0].1.starts_with("undecodable job payload: "));
    }
}
