//! Request entry point: create the draft, then run inline or enqueue.
//!
//! The caller always gets a finished record or an acceptance. An inline run
//! that fails is re-submitted to the queue rather than reported.

use std::sync::Arc;

use recap_core::dispatch::{self, DispatchMode};
use recap_core::models::{
    DateRange, JobPayload, NewSummary, RetryPolicy, SummaryKind, SummaryRecord, SummaryStatus,
};
use recap_core::{JobQueue, QueueError, StoreError, SummaryStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::processor::SummaryProcessor;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub kind: SummaryKind,
    pub owner_id: String,
    pub input_snapshot: serde_json::Value,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// Overrides the configured default model.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Submission {
    Completed(SummaryRecord),
    #[serde(rename_all = "camelCase")]
    Accepted {
        summary_id: Uuid,
        status: SummaryStatus,
    },
}

impl Submission {
    pub fn summary_id(&self) -> Uuid {
        match self {
            Submission::Completed(record) => record.id,
            Submission::Accepted { summary_id, .. } => *summary_id,
        }
    }

    pub fn status(&self) -> SummaryStatus {
        match self {
            Submission::Completed(record) => record.status,
            Submission::Accepted { status, .. } => *status,
        }
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Could not create summary record: {0}")]
    Create(#[from] StoreError),

    #[error("Could not enqueue summary {summary_id}: {source}")]
    Enqueue {
        summary_id: Uuid,
        #[source]
        source: QueueError,
    },
}

pub struct SummaryService {
    store: Arc<dyn SummaryStore>,
    queue: Arc<dyn JobQueue>,
    processor: Arc<SummaryProcessor>,
    default_model: String,
    policy: RetryPolicy,
    inline_threshold: u64,
}

impl SummaryService {
    pub fn new(
        store: Arc<dyn SummaryStore>,
        queue: Arc<dyn JobQueue>,
        processor: Arc<SummaryProcessor>,
        default_model: impl Into<String>,
        policy: RetryPolicy,
        inline_threshold: u64,
    ) -> Self {
        Self {
            store,
            queue,
            processor,
            default_model: default_model.into(),
            policy,
            inline_threshold,
        }
    }

    pub async fn submit(&self, request: GenerateRequest) -> Result<Submission, SubmitError> {
        let record = self
            .store
            .create(NewSummary {
                owner_id: request.owner_id.clone(),
                kind: request.kind,
                date_range: request.date_range,
                input_snapshot: request.input_snapshot.clone(),
            })
            .await?;

        let payload = JobPayload {
            summary_id: record.id,
            kind: request.kind,
            model: request.model.unwrap_or_else(|| self.default_model.clone()),
            input_snapshot: request.input_snapshot,
            owner_id: request.owner_id,
        };

        // A failed depth read reads as an empty queue; the inline path
        // does not need the queue unless it fails.
        let backlog = match self.queue.depth().await {
            Ok(depth) => depth.total(),
            Err(e) => {
                tracing::warn!(summary_id = %record.id, error = %e, "Queue depth unavailable, assuming empty backlog");
                0
            }
        };
        let mode = dispatch::decide(backlog, self.inline_threshold);
        tracing::debug!(summary_id = %record.id, backlog, ?mode, "Dispatch decided");

        match mode {
            DispatchMode::Inline => match self.processor.process(&payload).await {
                Ok(done) => Ok(Submission::Completed(done)),
                Err(e) => {
                    tracing::warn!(
                        summary_id = %record.id,
                        error = %e,
                        "Inline generation failed, falling back to queue"
                    );
                    self.enqueue(payload).await?;
                    let status = match self.store.find_by_id(record.id).await {
                        Ok(Some(current)) => current.status,
                        _ => record.status,
                    };
                    Ok(Submission::Accepted {
                        summary_id: record.id,
                        status,
                    })
                }
            },
            DispatchMode::Queued => {
                self.enqueue(payload).await?;
                Ok(Submission::Accepted {
                    summary_id: record.id,
                    status: record.status,
                })
            }
        }
    }

    async fn enqueue(&self, payload: JobPayload) -> Result<Uuid, SubmitError> {
        let summary_id = payload.summary_id;
        let job_id = self
            .queue
            .enqueue(payload, self.policy)
            .await
            .map_err(|source| SubmitError::Enqueue { summary_id, source })?;
        tracing::info!(summary_id = %summary_id, job_id = %job_id, "Summary queued");
        Ok(job_id)
    }
}
