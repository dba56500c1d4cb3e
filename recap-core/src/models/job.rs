use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::summary::SummaryKind;
use crate::backoff;

/// Everything a worker needs to (re)process one record. Lives only in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub summary_id: Uuid,
    pub kind: SummaryKind,
    pub model: String,
    pub input_snapshot: serde_json::Value,
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base · 2^(attempt-1)`
    #[default]
    Exponential,
    Fixed,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Fixed => "fixed",
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(BackoffStrategy::Exponential),
            "fixed" => Ok(BackoffStrategy::Fixed),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Retry policy attached to each enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total deliveries, including the first.
    pub attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_ms: 2000,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            attempts,
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_base_ms,
        }
    }

    /// Delay before redelivery after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.backoff_strategy {
            BackoffStrategy::Fixed => Duration::from_millis(self.backoff_base_ms),
            BackoffStrategy::Exponential => backoff::doubling(self.backoff_base_ms)
                .nth((attempt - 1) as usize)
                .unwrap_or(Duration::MAX),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

/// Backlog snapshot: jobs waiting plus jobs being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub active: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.waiting + self.active
    }
}

/// A job handed to exactly one worker until it completes, fails or dead-letters.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: Uuid,
    pub payload: JobPayload,
    /// 1-indexed delivery count for this job.
    pub attempt: u32,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Rescheduled { delay: Duration },
    DeadLettered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_three_attempts_from_two_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[test]
    fn should_retry_respects_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn payload_serializes_camel_case() {
        let payload = JobPayload {
            summary_id: Uuid::nil(),
            kind: SummaryKind::Trade,
            model: "m".to_string(),
            input_snapshot: serde_json::json!({}),
            owner_id: "u".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("summaryId").is_some());
        assert_eq!(value["kind"], "trade");
    }

    #[test]
    fn depth_total_counts_waiting_and_active() {
        let depth = QueueDepth { waiting: 2, active: 3 };
        assert_eq!(depth.total(), 5);
    }
}
