//! Summary processor: the orchestration shared by queue workers and the
//! inline path.
//!
//! Prompt → model → checkpoint → parse → final write. The checkpoint stores
//! the raw reply with `status=processing` before anything can fail, so the
//! model output survives a crash in any later step.

use std::sync::Arc;

use recap_core::gateway::{CallOptions, ChatModel};
use recap_core::models::{JobPayload, RecordPatch, SummaryFields, SummaryKind, SummaryRecord};
use recap_core::{parser, prompt, ParseFailurePolicy, StoreError, SummaryStore};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Stored on the record when the reply is unparseable and the policy is `failed`.
pub const PARSE_FAILURE_MESSAGE: &str = "Model reply could not be parsed into a summary";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("summary record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProcessError {
    /// A missing record will still be missing on the next attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProcessError::RecordNotFound(_) | ProcessError::Store(StoreError::NotFound(_))
        )
    }
}

pub struct SummaryProcessor {
    store: Arc<dyn SummaryStore>,
    model: Arc<dyn ChatModel>,
    options: CallOptions,
    on_parse_failure: ParseFailurePolicy,
}

impl SummaryProcessor {
    pub fn new(
        store: Arc<dyn SummaryStore>,
        model: Arc<dyn ChatModel>,
        options: CallOptions,
        on_parse_failure: ParseFailurePolicy,
    ) -> Self {
        Self {
            store,
            model,
            options,
            on_parse_failure,
        }
    }

    /// Run one payload to a terminal record. Safe to repeat for the same
    /// payload: the final fields are a pure function of the raw reply.
    pub async fn process(&self, payload: &JobPayload) -> Result<SummaryRecord, ProcessError> {
        let id = payload.summary_id;

        let record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(ProcessError::RecordNotFound(id))?;
        tracing::debug!(summary_id = %id, kind = %payload.kind, status = %record.status, "Processing summary");

        let messages = prompt::build_messages(payload.kind, &payload.input_snapshot);
        let raw = self
            .model
            .call_chat(&payload.model, &messages, &self.options)
            .await;

        self.store
            .update_fields(id, &RecordPatch::checkpoint(raw.as_str(), payload.model.as_str()))
            .await?;

        match self.finish(payload, &raw).await {
            Ok(record) => Ok(record),
            Err(e) => {
                let patch = RecordPatch::failed(&e.to_string());
                if let Err(mark_err) = self.store.update_fields(id, &patch).await {
                    tracing::error!(
                        summary_id = %id,
                        error = %mark_err,
                        "Failed to mark summary as failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn finish(
        &self,
        payload: &JobPayload,
        raw: &str,
    ) -> Result<SummaryRecord, ProcessError> {
        let id = payload.summary_id;

        let fields = match parser::parse(raw) {
            Some(fields) => fields,
            None if self.on_parse_failure == ParseFailurePolicy::Failed => {
                tracing::warn!(summary_id = %id, "Unparseable model reply, marking summary failed");
                let record = self
                    .store
                    .update_fields(id, &RecordPatch::failed(PARSE_FAILURE_MESSAGE))
                    .await?;
                return Ok(record);
            }
            None => {
                tracing::warn!(summary_id = %id, "Unparseable model reply, storing fallback text");
                SummaryFields::fallback(payload.kind)
            }
        };

        let fields = attach_stats(payload.kind, fields, &payload.input_snapshot);
        let record = self
            .store
            .update_fields(id, &RecordPatch::ready(fields))
            .await?;

        tracing::info!(summary_id = %id, kind = %payload.kind, status = %record.status, "Summary generated");
        Ok(record)
    }
}

/// Aggregates keep the reply's stats, else the snapshot's `stats` object.
/// Trade summaries carry none.
fn attach_stats(kind: SummaryKind, mut fields: SummaryFields, snapshot: &Value) -> SummaryFields {
    if !kind.is_aggregate() {
        fields.weekly_stats = None;
    } else if fields.weekly_stats.is_none() {
        fields.weekly_stats = snapshot.get("stats").filter(|s| s.is_object()).cloned();
    }
    fields
}
