//! Durable job queue consumed by the worker pool.
//!
//! Delivery is at-least-once: a claimed job that is never completed or failed
//! (worker crash) becomes claimable again once its lease expires.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{BackoffStrategy, ClaimedJob, FailOutcome, JobPayload, QueueDepth, RetryPolicy};

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload, policy: RetryPolicy) -> Result<Uuid, QueueError>;

    /// Waiting plus active jobs at this instant.
    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Take the next due job, if any, and mark it active.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Record a failed attempt. Reschedules with the job's backoff or
    /// dead-letters it when attempts are exhausted.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError>;

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError>;
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    DeadLettered,
}

// ============================================================================
// In-memory
// ============================================================================

/// Snapshot of one in-memory job, for inspection in tests.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub payload: JobPayload,
    pub policy: RetryPolicy,
    pub attempt: u32,
    pub state: JobState,
    pub last_error: Option<String>,
    run_at: Instant,
}

/// FIFO queue honoring retry delays. Leases are not tracked; an active job
/// stays active until completed or failed.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<QueuedJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<QueuedJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.state == JobState::DeadLettered)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload, policy: RetryPolicy) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        self.jobs.lock().await.push(QueuedJob {
            id,
            payload,
            policy,
            attempt: 0,
            state: JobState::Waiting,
            last_error: None,
            run_at: Instant::now(),
        });
        Ok(id)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let jobs = self.jobs.lock().await;
        let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count() as u64;
        Ok(QueueDepth {
            waiting: count(JobState::Waiting),
            active: count(JobState::Active),
        })
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let now = Instant::now();
        let next = jobs
            .iter_mut()
            .filter(|j| j.state == JobState::Waiting && j.run_at <= now)
            .min_by_key(|j| j.run_at);

        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.attempt += 1;
            ClaimedJob {
                job_id: job.id,
                payload: job.payload.clone(),
                attempt: job.attempt,
                policy: job.policy,
            }
        }))
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.state = JobState::Completed;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.last_error = Some(error.to_string());

        if job.policy.should_retry(job.attempt) {
            let delay = job.policy.delay_for_attempt(job.attempt);
            job.state = JobState::Waiting;
            job.run_at = Instant::now() + delay;
            Ok(FailOutcome::Rescheduled { delay })
        } else {
            job.state = JobState::DeadLettered;
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        job.state = JobState::DeadLettered;
        job.last_error = Some(reason.to_string());
        Ok(())
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Queue over the `summary_jobs` table. Concurrent workers claim disjoint
/// rows via `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

fn policy_from_row(attempts: i32, strategy: &str, base_ms: i64) -> RetryPolicy {
    RetryPolicy {
        attempts: attempts.max(0) as u32,
        backoff_strategy: strategy.parse().unwrap_or(BackoffStrategy::Exponential),
        backoff_base_ms: base_ms.max(0) as u64,
    }
}

/// A redelivered job whose lease ran out on its final attempt comes back with
/// `attempt` past the budget. Such jobs are dead-lettered instead of rerun.
fn attempts_exhausted(attempt: u32, policy: &RetryPolicy) -> bool {
    attempt > policy.attempts.max(1)
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: JobPayload, policy: RetryPolicy) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let body = serde_json::to_value(&payload)?;

        sqlx::query(
            "INSERT INTO summary_jobs \
               (id, payload, state, attempt, max_attempts, backoff_strategy, backoff_base_ms, \
                run_at, created_at, updated_at) \
             VALUES ($1, $2, 'waiting', 0, $3, $4, $5, NOW(), NOW(), NOW())",
        )
        .bind(id)
        .bind(&body)
        .bind(policy.attempts as i32)
        .bind(policy.backoff_strategy.as_str())
        .bind(policy.backoff_base_ms as i64)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %id, summary_id = %payload.summary_id, "Enqueued summary job");
        Ok(id)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let (waiting, active): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE state = 'waiting'), \
                    COUNT(*) FILTER (WHERE state = 'active') \
             FROM summary_jobs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueDepth {
            waiting: waiting.max(0) as u64,
            active: active.max(0) as u64,
        })
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            let row: Option<(Uuid, serde_json::Value, i32, i32, String, i64)> = sqlx::query_as(
                "UPDATE summary_jobs \
                 SET state = 'active', attempt = attempt + 1, \
                     locked_until = NOW() + make_interval(secs => $1), updated_at = NOW() \
                 WHERE id = ( \
                     SELECT id FROM summary_jobs \
                     WHERE (state = 'waiting' AND run_at <= NOW()) \
                        OR (state = 'active' AND locked_until < NOW()) \
                     ORDER BY run_at, created_at \
                     LIMIT 1 \
                     FOR UPDATE SKIP LOCKED) \
                 RETURNING id, payload, attempt, max_attempts, backoff_strategy, backoff_base_ms",
            )
            .bind(self.lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

            let Some((job_id, body, attempt, max_attempts, strategy, base_ms)) = row else {
                return Ok(None);
            };

            let attempt = attempt.max(0) as u32;
            let policy = policy_from_row(max_attempts, &strategy, base_ms);
            if attempts_exhausted(attempt, &policy) {
                tracing::warn!(job_id = %job_id, attempt, "Lease expired on final attempt, dead-lettering");
                self.dead_letter(job_id, "lease expired after final attempt")
                    .await?;
                continue;
            }

            match serde_json::from_value::<JobPayload>(body) {
                Ok(payload) => {
                    return Ok(Some(ClaimedJob {
                        job_id,
                        payload,
                        attempt,
                        policy,
                    }));
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Undecodable job payload, dead-lettering");
                    self.dead_letter(job_id, &format!("undecodable payload: {e}"))
                        .await?;
                }
            }
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE summary_jobs SET state = 'completed', locked_until = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i32, i32, String, i64)> = sqlx::query_as(
            "SELECT attempt, max_attempts, backoff_strategy, backoff_base_ms \
             FROM summary_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (attempt, max_attempts, strategy, base_ms) = row.ok_or(QueueError::NotFound(job_id))?;
        let policy = policy_from_row(max_attempts, &strategy, base_ms);
        let attempt = attempt.max(0) as u32;

        let outcome = if policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt);
            sqlx::query(
                "UPDATE summary_jobs \
                 SET state = 'waiting', run_at = NOW() + make_interval(secs => $2), \
                     locked_until = NULL, last_error = $3, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(delay.as_secs_f64())
            .bind(error)
            .execute(&mut *tx)
            .await?;
            FailOutcome::Rescheduled { delay }
        } else {
            sqlx::query(
                "UPDATE summary_jobs \
                 SET state = 'dead', locked_until = NULL, last_error = $2, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            FailOutcome::DeadLettered
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn dead_letter(&self, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE summary_jobs \
             SET state = 'dead', locked_until = NULL, last_error = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }
}
