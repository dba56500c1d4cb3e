//! End-to-end pipeline tests against in-memory adapters and a mocked model
//! endpoint.
//!
//! These tests verify:
//! 1. Inline path produces a ready record from a clean reply
//! 2. Missing credentials and dead endpoints still yield a ready record
//! 3. Queued path enqueues with the default retry policy and a worker drains it
//! 4. Raw replies survive a failure after the checkpoint
//! 5. A failed inline run falls back to the queue

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recap_core::gateway::{CallOptions, GatewayConfig, ModelGateway};
use recap_core::models::{
    BackoffStrategy, JobPayload, NewSummary, RecordPatch, RetryPolicy, SummaryKind, SummaryRecord,
    SummaryStatus,
};
use recap_core::{
    InMemoryJobQueue, InMemorySummaryStore, JobQueue, ParseFailurePolicy, StoreError,
    SummaryStore,
};
use recap_server::subsystems::processor::SummaryProcessor;
use recap_server::subsystems::submit::{GenerateRequest, Submission, SummaryService};
use recap_server::subsystems::worker::Worker;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const THRESHOLD: u64 = 5;

/// Store that refuses the final `ready` write.
struct FailingFinalWriteStore {
    inner: InMemorySummaryStore,
}

#[async_trait]
impl SummaryStore for FailingFinalWriteStore {
    async fn create(&self, new: NewSummary) -> Result<SummaryRecord, StoreError> {
        self.inner.create(new).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SummaryRecord>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn update_fields(
        &self,
        id: Uuid,
        patch: &RecordPatch,
    ) -> Result<SummaryRecord, StoreError> {
        if patch.status == Some(SummaryStatus::Ready) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        self.inner.update_fields(id, patch).await
    }
}

fn gateway(bases: Vec<String>, api_key: Option<&str>) -> Arc<ModelGateway> {
    Arc::new(
        ModelGateway::new(GatewayConfig {
            api_key: api_key.map(str::to_string),
            bases,
            retry_rounds: 2,
            backoff_base_ms: 1,
        })
        .expect("Failed to create gateway"),
    )
}

fn service(
    store: Arc<dyn SummaryStore>,
    queue: Arc<InMemoryJobQueue>,
    model: Arc<ModelGateway>,
) -> SummaryService {
    let processor = Arc::new(SummaryProcessor::new(
        store.clone(),
        model,
        CallOptions {
            timeout_ms: 2_000,
            ..Default::default()
        },
        ParseFailurePolicy::Ready,
    ));
    SummaryService::new(
        store,
        queue,
        processor,
        "test-model",
        RetryPolicy::default(),
        THRESHOLD,
    )
}

fn weekly_request() -> GenerateRequest {
    GenerateRequest {
        kind: SummaryKind::Weekly,
        owner_id: "owner-1".to_string(),
        input_snapshot: json!({
            "startDate": "2024-03-04",
            "endDate": "2024-03-10",
            "totalTrades": 2,
            "trades": [
                {"symbol": "AAPL", "pnl": 120.0},
                {"symbol": "MSFT", "pnl": -40.0}
            ]
        }),
        date_range: None,
        model: None,
    }
}

async fn fill_backlog(queue: &InMemoryJobQueue, depth: usize) {
    for _ in 0..depth {
        queue
            .enqueue(
                JobPayload {
                    summary_id: Uuid::new_v4(),
                    kind: SummaryKind::Trade,
                    model: "test-model".to_string(),
                    input_snapshot: json!({}),
                    owner_id: "someone-else".to_string(),
                },
                RetryPolicy::default(),
            )
            .await
            .unwrap();
    }
}

async fn mock_chat_reply(content: &str) -> MockServer {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        })))
        .mount(&mock_server)
        .await;
    mock_server
}

#[tokio::test]
async fn test_inline_path_produces_ready_record() {
    let mock_server = mock_chat_reply(
        r#"{"summaryText":"Good week","plusPoints":["A"],"minusPoints":[],"aiSuggestions":["B"]}"#,
    )
    .await;
    let store = Arc::new(InMemorySummaryStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    fill_backlog(&queue, 2).await;

    let svc = service(store.clone(), queue.clone(), gateway(vec![mock_server.uri()], Some("k")));
    let submission = svc.submit(weekly_request()).await.unwrap();

    let Submission::Completed(record) = submission else {
        panic!("expected inline completion");
    };
    assert_eq!(record.status, SummaryStatus::Ready);
    assert_eq!(record.summary_text.as_deref(), Some("Good week"));
    assert_eq!(record.plus_points, vec!["A"]);
    assert_eq!(record.ai_suggestions, vec!["B"]);
    // backlog untouched
    assert_eq!(queue.depth().await.unwrap().total(), 2);
}

#[tokio::test]
async fn test_missing_credential_yields_ready_fallback() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let store = Arc::new(InMemorySummaryStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let svc = service(store, queue, gateway(vec![mock_server.uri()], None));

    let submission = svc.submit(weekly_request()).await.unwrap();
    let Submission::Completed(record) = submission else {
        panic!("expected inline completion");
    };
    assert_eq!(record.status, SummaryStatus::Ready);
    assert!(record.summary_text.unwrap().contains("fallback"));
}

#[tokio::test]
async fn test_all_bases_failing_still_completes() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        // 2 rounds × (chat + legacy)
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(server)
            .await;
    }

    let store = Arc::new(InMemorySummaryStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let svc = service(
        store,
        queue,
        gateway(vec![first.uri(), second.uri()], Some("k")),
    );

    let submission = svc.submit(weekly_request()).await.unwrap();
    let Submission::Completed(record) = submission else {
        panic!("expected inline completion");
    };
    assert_eq!(record.status, SummaryStatus::Ready);
    assert!(record.summary_text.unwrap().starts_with("Summary (fallback)."));
    assert!(record.raw_response.is_some());
}

#[tokio::test]
async fn test_busy_queue_defers_to_worker() {
    let mock_server = mock_chat_reply(r#"{"summaryText":"Queued week"}"#).await;
    let store = Arc::new(InMemorySummaryStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    fill_backlog(&queue, 6).await;
    let model = gateway(vec![mock_server.uri()], Some("k"));

    let svc = service(store.clone(), queue.clone(), model.clone());
    let submission = svc.submit(weekly_request()).await.unwrap();

    let Submission::Accepted { summary_id, status } = submission else {
        panic!("expected acceptance");
    };
    assert_eq!(status, SummaryStatus::Draft);

    let jobs = queue.jobs().await;
    let job = jobs
        .iter()
        .find(|j| j.payload.summary_id == summary_id)
        .expect("job enqueued");
    assert_eq!(job.policy.attempts, 3);
    assert_eq!(job.policy.backoff_strategy, BackoffStrategy::Exponential);
    assert_eq!(job.policy.backoff_base_ms, 2000);
    assert_eq!(job.payload.model, "test-model");

    // Drain: the six filler jobs point at missing records and are dead-lettered.
    let processor = Arc::new(SummaryProcessor::new(
        store.clone(),
        model,
        CallOptions::default(),
        ParseFailurePolicy::Ready,
    ));
    let worker = Worker::new(0, queue.clone(), processor, Duration::from_millis(10));
    while worker.run_once().await.unwrap() {}

    let record = store.find_by_id(summary_id).await.unwrap().unwrap();
    assert_eq!(record.status, SummaryStatus::Ready);
    assert_eq!(record.summary_text.as_deref(), Some("Queued week"));
    assert_eq!(queue.dead_letters().await.len(), 6);
    assert_eq!(queue.depth().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_raw_reply_survives_failure_after_checkpoint() {
    let reply = r#"{"summaryText":"Kept"}"#;
    let mock_server = mock_chat_reply(reply).await;
    let store = Arc::new(FailingFinalWriteStore {
        inner: InMemorySummaryStore::new(),
    });
    let record = store
        .create(NewSummary {
            owner_id: "owner-1".to_string(),
            kind: SummaryKind::Trade,
            date_range: None,
            input_snapshot: json!({"symbol": "AAPL"}),
        })
        .await
        .unwrap();

    let processor = SummaryProcessor::new(
        store.clone(),
        gateway(vec![mock_server.uri()], Some("k")),
        CallOptions::default(),
        ParseFailurePolicy::Ready,
    );
    let payload = JobPayload {
        summary_id: record.id,
        kind: SummaryKind::Trade,
        model: "test-model".to_string(),
        input_snapshot: json!({"symbol": "AAPL"}),
        owner_id: "owner-1".to_string(),
    };

    let err = processor.process(&payload).await.unwrap_err();
    assert!(err.is_retryable());

    let stored = store.find_by_id(record.id).await.unwrap().unwrap();
    assert_eq!(stored.raw_response.as_deref(), Some(reply));
    assert_eq!(stored.status, SummaryStatus::Failed);
    assert!(stored
        .error_message
        .as_deref()
        .unwrap()
        .contains("injected write failure"));
}

#[tokio::test]
async fn test_inline_failure_falls_back_to_queue() {
    let mock_server = mock_chat_reply(r#"{"summaryText":"ok"}"#).await;
    let store: Arc<dyn SummaryStore> = Arc::new(FailingFinalWriteStore {
        inner: InMemorySummaryStore::new(),
    });
    let queue = Arc::new(InMemoryJobQueue::new());
    let svc = service(store, queue.clone(), gateway(vec![mock_server.uri()], Some("k")));

    let submission = svc.submit(weekly_request()).await.unwrap();
    let Submission::Accepted { summary_id, status } = submission else {
        panic!("inline failure must be reported as accepted");
    };
    assert_eq!(status, SummaryStatus::Failed);

    let jobs = queue.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload.summary_id, summary_id);
    assert_eq!(jobs[0].policy, RetryPolicy::default());
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let mock_server = mock_chat_reply("```json\n{summaryText: 'ok', plusPoints: ['a','b'],}\n```").await;
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
    let payload = JobPayload {
        summary_id: record.id,
        kind: SummaryKind::Trade,
        model: "test-model".to_string(),
        input_snapshot: json!({}),
        owner_id: "owner-1".to_string(),
    };
    queue.enqueue(payload.clone(), RetryPolicy::default()).await.unwrap();
    queue.enqueue(payload, RetryPolicy::default()).await.unwrap();

    let processor = Arc::new(SummaryProcessor::new(
        store.clone(),
        gateway(vec![mock_server.uri()], Some("k")),
        CallOptions::default(),
        ParseFailurePolicy::Ready,
    ));
    let worker = Worker::new(0, queue.clone(), processor, Duration::from_millis(10));

    assert!(worker.run_once().await.unwrap());
    let first = store.find_by_id(record.id).await.unwrap().unwrap();
    assert!(worker.run_once().await.unwrap());
    let second = store.find_by_id(record.id).await.unwrap().unwrap();

    assert_eq!(first.fields(), second.fields());
    assert_eq!(second.summary_text.as_deref(), Some("ok"));
    assert_eq!(second.plus_points, vec!["a", "b"]);
    assert_eq!(second.status, SummaryStatus::Ready);
}
