//! Queue worker: claims jobs one at a time and runs them through the
//! `SummaryProcessor`.
//!
//! Failures are handed back to the queue, whose retry policy decides between
//! rescheduling and dead-lettering. A missing record is dead-lettered at once.

use std::sync::Arc;
use std::time::Duration;

use recap_core::models::FailOutcome;
use recap_core::{JobQueue, QueueError};
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::processor::SummaryProcessor;

pub struct Worker {
    id: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<SummaryProcessor>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        processor: Arc<SummaryProcessor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            processor,
            poll_interval,
        }
    }

    /// Drain the queue until shutdown. Sleeps `poll_interval` when idle.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(worker = self.id, poll_ms = self.poll_interval.as_millis() as u64, "Summary worker started");

        loop {
            match self.run_once().await {
                Ok(true) => {
                    if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                        break;
                    }
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Queue operation failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        tracing::info!(worker = self.id, "Summary worker shutting down");
    }

    /// Process at most one job. Returns whether a job was claimed.
    ///
    /// Public for unit testing.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self.queue.claim().await? else {
            return Ok(false);
        };
        let summary_id = job.payload.summary_id;

        match self.processor.process(&job.payload).await {
            Ok(record) => {
                self.queue.complete(job.job_id).await?;
                tracing::info!(
                    worker = self.id,
                    job_id = %job.job_id,
                    summary_id = %summary_id,
                    attempt = job.attempt,
                    status = %record.status,
                    "Job completed"
                );
            }
            Err(e) if e.is_retryable() => {
                match self.queue.fail(job.job_id, &e.to_string()).await? {
                    FailOutcome::Rescheduled { delay } => tracing::warn!(
                        worker = self.id,
                        job_id = %job.job_id,
                        summary_id = %summary_id,
                        attempt = job.attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Job failed, rescheduled"
                    ),
                    FailOutcome::DeadLettered => tracing::error!(
                        worker = self.id,
                        job_id = %job.job_id,
                        summary_id = %summary_id,
                        attempt = job.attempt,
                        error = %e,
                        "Job failed on final attempt, dead-lettered"
                    ),
                }
            }
            Err(e) => {
                self.queue.dead_letter(job.job_id, &e.to_string()).await?;
                tracing::error!(
                    worker = self.id,
                    job_id = %job.job_id,
                    summary_id = %summary_id,
                    error = %e,
                    "Job failed permanently, dead-lettered"
                );
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recap_core::gateway::{CallOptions, ChatModel};
    use recap_core::models::{JobPayload, NewSummary, RetryPolicy, SummaryKind, SummaryStatus};
    use recap_core::prompt::ChatMessage;
    use recap_core::queue::JobState;
    use recap_core::{InMemoryJobQueue, InMemorySummaryStore, ParseFailurePolicy, SummaryStore};
    use serde_json::json;
    use uuid::Uuid;

    struct EchoModel;

    #[async_trait]
    impl ChatModel for EchoModel {
        async fn call_chat(&self, _: &str, _: &[ChatMessage], _: &CallOptions) -> String {
            r#"{"summaryText":"done"}"#.to_string()
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn worker(store: Arc<InMemorySummaryStore>, queue: Arc<InMemoryJobQueue>) -> Worker {
        let processor = SummaryProcessor::new(
            store,
            Arc::new(EchoModel),
            CallOptions::default(),
            ParseFailurePolicy::Ready,
        );
        Worker::new(0, queue, Arc::new(processor), Duration::from_millis(10))
    }

    fn payload(summary_id: Uuid) -> JobPayload {
        JobPayload {
            summary_id,
            kind: SummaryKind::Trade,
            model: "model-a".to_string(),
            input_snapshot: json!({}),
            owner_id: "owner-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let w = worker(
            Arc::new(InMemorySummaryStore::new()),
            Arc::new(InMemoryJobQueue::new()),
        );
        assert!(!w.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_once_completes_job() {
        let store = Arc::new(InMemorySummaryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let record = store
            .create(NewSummary {
                owner_id: "owner-1".to_string(),
                kind: SummaryKind::Trade,
                date_range: None,
                input_snapshot: json!({}),
            })
            .await
            .unwrap();
        queue
            .enqueue(payload(record.id), RetryPolicy::default())
            .await
            .unwrap();

        let w = worker(store.clone(), queue.clone());
        assert!(w.run_once().await.unwrap());

        let stored = store.find_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SummaryStatus::Ready);
        assert_eq!(queue.jobs().await[0].state, JobState::Completed);
        assert_eq!(queue.depth().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_missing_record_is_dead_lettered_immediately() {
        let store = Arc::new(InMemorySummaryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        queue
            .enqueue(payload(Uuid::new_v4()), RetryPolicy::default())
            .await
            .unwrap();

        let w = worker(store, queue.clone());
        assert!(w.run_once().await.unwrap());

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let w = worker(
            Arc::new(InMemorySummaryStore::new()),
            Arc::new(InMemoryJobQueue::new()),
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(w.run(rx));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
