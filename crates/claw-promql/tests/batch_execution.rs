//! Integration tests for request execution.
//!
//! A fake in-memory backend answers by query text and can delay or fail
//! individual queries, which lets these tests check the ordering,
//! bounded-concurrency and fail-fast guarantees of batch execution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_promql::{
    Argument, ClientError, ClientResponse, CollectionRequest, ComparisonOperator, Expression,
    NativeArgumentType, NativeQueryRequest, NativeQueryTemplate, OrderByElement, OrderDirection,
    PromqlError, QueryClient, QueryExecutor, QueryOutput, QueryResult, QueryValue, RuntimeSettings,
    Sample, Series, TimestampFormat, ValueFormat, Variables,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fake Backend
// ============================================================================

#[derive(Default)]
struct FakeBackend {
    responses: HashMap<String, ClientResponse>,
    failures: HashMap<String, ClientError>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeBackend {
    fn respond(mut self, query: &str, response: ClientResponse) -> Self {
        self.responses.insert(query.to_string(), response);
        self
    }

    fn fail(mut self, query: &str, error: ClientError) -> Self {
        self.failures.insert(query.to_string(), error);
        self
    }

    fn delay(mut self, query: &str, delay: Duration) -> Self {
        self.delays.insert(query.to_string(), delay);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn answer(&self, query: &str) -> impl Future<Output = Result<ClientResponse, ClientError>> + Send + '_ {
        self.calls.lock().unwrap().push(query.to_string());
        let result = match self.failures.get(query) {
            Some(err) => Err(err.clone()),
            None => Ok(self
                .responses
                .get(query)
                .cloned()
                .unwrap_or_else(|| ClientResponse::new(QueryValue::Vector(Vec::new())))),
        };
        let delay = self.delays.get(query).copied();
        async move {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

impl QueryClient for FakeBackend {
    fn query(
        &self,
        query: &str,
        _time: DateTime<Utc>,
        _timeout: Option<Duration>,
    ) -> impl Future<Output = Result<ClientResponse, ClientError>> + Send {
        self.answer(query)
    }

    fn query_range(
        &self,
        query: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _step: Duration,
        _timeout: Option<Duration>,
    ) -> impl Future<Output = Result<ClientResponse, ClientError>> + Send {
        self.answer(query)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn job_query(job: &str) -> String {
    format!(r#"up{{job="{job}"}}"#)
}

fn job_request() -> CollectionRequest {
    CollectionRequest::new("up").with_predicate(Expression::compare_variable(
        "job",
        ComparisonOperator::Eq,
        "job",
    ))
}

fn binding(job: &str) -> Variables {
    Variables::from([("job".to_string(), Value::from(job))])
}

/// One series per job; later jobs answer faster than earlier ones.
fn staggered_backend(jobs: &[String]) -> FakeBackend {
    let count = jobs.len() as u64;
    jobs.iter()
        .enumerate()
        .fold(FakeBackend::default(), |backend, (i, job)| {
            let query = job_query(job);
            backend
                .respond(&query, ClientResponse::new(QueryValue::Vector(vec![Sample::new(0, 1.0).label("job", job.as_str())])))
                .delay(&query, Duration::from_millis((count - i as u64) * 10))
        })
}

fn jobs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("job-{i:02}")).collect()
}

fn first_job(result: &QueryResult) -> String {
    result.output.rows().unwrap()[0].labels["job"].clone()
}

fn hundred_samples() -> QueryValue {
    // Distinct values and timestamps in a scrambled order.
    QueryValue::Vector(
        (0..100_i64)
            .map(|i| {
                let k = (i * 37) % 100;
                #[allow(clippy::cast_precision_loss)]
                let value = k as f64 * 1.5;
                Sample::new(k * 1_000, value).label("id", k.to_string())
            })
            .collect(),
    )
}

// ============================================================================
// Batch Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn batch_preserves_input_order_under_bounded_concurrency() {
    let jobs = jobs(12);
    let executor = QueryExecutor::new(
        staggered_backend(&jobs),
        RuntimeSettings::default().with_concurrency_limit(3),
    );
    let bindings = jobs.iter().map(|job| binding(job)).collect();

    let results = executor.execute_batch(&job_request(), bindings).await.unwrap();

    assert_eq!(results.len(), jobs.len());
    let order: Vec<String> = results.iter().map(first_job).collect();
    assert_eq!(order, jobs);
    assert!(executor.client().peak() <= 3, "peak was {}", executor.client().peak());
    assert_eq!(executor.client().calls().len(), jobs.len());
}

#[tokio::test]
async fn sequential_batch_preserves_input_order() {
    let jobs = jobs(4);
    let executor = QueryExecutor::new(staggered_backend(&jobs), RuntimeSettings::default());
    let bindings = jobs.iter().map(|job| binding(job)).collect();

    let results = executor.execute_batch(&job_request(), bindings).await.unwrap();

    let order: Vec<String> = results.iter().map(first_job).collect();
    assert_eq!(order, jobs);
    assert_eq!(executor.client().peak(), 1);
}

#[tokio::test(start_paused = true)]
async fn injected_failure_fails_the_whole_batch() {
    let jobs = jobs(8);
    for failing in [0, 5, 7] {
        let backend = staggered_backend(&jobs).fail(
            &job_query(&jobs[failing]),
            ClientError::Transport("connection reset".to_string()),
        );
        let executor = QueryExecutor::new(backend, RuntimeSettings::default().with_concurrency_limit(3));
        let bindings = jobs.iter().map(|job| binding(job)).collect();

        let err = executor.execute_batch(&job_request(), bindings).await.unwrap_err();
        match err {
            PromqlError::Backend { query, source } => {
                assert_eq!(query, job_query(&jobs[failing]));
                assert_eq!(source, ClientError::Transport("connection reset".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn early_failure_keeps_queued_units_from_the_backend() {
    let jobs = jobs(8);
    let backend = jobs[1..].iter().fold(FakeBackend::default(), |backend, job| {
        backend.delay(&job_query(job), Duration::from_secs(1))
    });
    let backend = backend.fail(
        &job_query(&jobs[0]),
        ClientError::Status {
            code: 503,
            message: "unavailable".to_string(),
        },
    );
    let executor = QueryExecutor::new(backend, RuntimeSettings::default().with_concurrency_limit(2));
    let bindings: Vec<Variables> = jobs.iter().map(|job| binding(job)).collect();
    let total = bindings.len();

    let err = executor.execute_batch(&job_request(), bindings).await.unwrap_err();

    assert!(matches!(err, PromqlError::Backend { ref query, .. } if *query == job_query(&jobs[0])));
    let calls = executor.client().calls();
    assert!(calls.len() < total, "queued units reached the backend: {calls:?}");
    assert!(!calls.contains(&job_query(&jobs[7])));
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation_stops_units_in_flight() {
    let jobs = jobs(6);
    let backend = jobs.iter().fold(FakeBackend::default(), |backend, job| {
        backend.delay(&job_query(job), Duration::from_secs(1))
    });
    let executor = QueryExecutor::new(backend, RuntimeSettings::default().with_concurrency_limit(2));
    let bindings = jobs.iter().map(|job| binding(job)).collect();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = executor
        .execute_batch_with_cancellation(&job_request(), bindings, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PromqlError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(executor.client().calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn compile_failure_in_one_binding_fails_the_batch() {
    let jobs = jobs(4);
    let executor = QueryExecutor::new(
        staggered_backend(&jobs),
        RuntimeSettings::default().with_concurrency_limit(2),
    );
    let mut bindings: Vec<Variables> = jobs.iter().map(|job| binding(job)).collect();
    bindings[2] = Variables::new();

    let err = executor.execute_batch(&job_request(), bindings).await.unwrap_err();
    assert!(matches!(err, PromqlError::UnboundVariable(ref name) if name == "job"));
}

#[tokio::test(start_paused = true)]
async fn native_batch_substitutes_each_binding() {
    let jobs = jobs(5);
    let template = NativeQueryTemplate::new(r#"up{job="${job}"}"#).with_argument("job", NativeArgumentType::String);
    let request = NativeQueryRequest::new().with_argument("job", Argument::variable("job"));
    let executor = QueryExecutor::new(
        staggered_backend(&jobs),
        RuntimeSettings::default().with_concurrency_limit(4),
    );
    let bindings = jobs.iter().map(|job| binding(job)).collect();

    let results = executor
        .execute_native_batch(Some(&template), &request, bindings)
        .await
        .unwrap();

    let order: Vec<String> = results.iter().map(first_job).collect();
    assert_eq!(order, jobs);
}

// ============================================================================
// Sorting And Pagination Tests
// ============================================================================

fn sorted_ids(direction: OrderDirection, column: &str, page: (Option<usize>, Option<usize>)) -> Vec<String> {
    let backend = FakeBackend::default().respond("sample_metric", ClientResponse::new(hundred_samples()));
    let executor = QueryExecutor::new(backend, RuntimeSettings::default());
    let request = CollectionRequest::new("sample_metric")
        .with_order_by(OrderByElement::column(column, direction))
        .with_page(page.0, page.1);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let result = runtime
        .block_on(executor.execute(&request, &Variables::new()))
        .unwrap();
    result
        .output
        .rows()
        .unwrap()
        .iter()
        .map(|row| row.labels["id"].clone())
        .collect()
}

#[test]
fn value_sort_descending_reverses_ascending() {
    let ascending = sorted_ids(OrderDirection::Asc, "value", (None, None));
    let mut descending = sorted_ids(OrderDirection::Desc, "value", (None, None));

    assert_eq!(ascending.len(), 100);
    descending.reverse();
    assert_eq!(ascending, descending);
}

#[test]
fn timestamp_sort_then_page_picks_index() {
    let all = sorted_ids(OrderDirection::Asc, "timestamp", (None, None));
    let page = sorted_ids(OrderDirection::Asc, "timestamp", (Some(50), Some(1)));

    assert_eq!(page, vec![all[50].clone()]);
    assert_eq!(page, vec!["50".to_string()]);
}

#[test]
fn offset_past_the_end_is_empty() {
    assert!(sorted_ids(OrderDirection::Asc, "value", (Some(100), None)).is_empty());
    assert!(sorted_ids(OrderDirection::Asc, "value", (Some(250), Some(10))).is_empty());
    assert_eq!(sorted_ids(OrderDirection::Asc, "value", (Some(95), Some(50))).len(), 5);
}

// ============================================================================
// Shaping Tests
// ============================================================================

#[tokio::test]
async fn grouped_rows_mirror_the_last_point() {
    let backend = FakeBackend::default().respond(
        "up",
        ClientResponse::new(QueryValue::Matrix(vec![Series::new()
            .label("job", "api")
            .point(1_000, 1.0)
            .point(2_000, 0.5)])),
    );
    let settings = RuntimeSettings::default()
        .with_timestamp_format(TimestampFormat::Unix)
        .with_value_format(ValueFormat::Float64);
    let executor = QueryExecutor::new(backend, settings);
    let request = CollectionRequest::new("up")
        .with_predicate(Expression::compare("timestamp", ComparisonOperator::Gte, 0))
        .with_argument("step", Argument::literal("1s"));

    let result = executor.execute(&request, &Variables::new()).await.unwrap();
    let QueryOutput::Rows(rows) = result.output else {
        panic!("expected rows");
    };
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, json!(2_000));
    assert_eq!(rows[0].value, json!(0.5));
    assert_eq!(rows[0].values.as_ref().map(Vec::len), Some(2));
}
