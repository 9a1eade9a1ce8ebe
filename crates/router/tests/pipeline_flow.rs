//! End-to-end pipeline runs over the in-memory transport and job store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hopline_core::{Job, JobId, JobStatus, Route};
use hopline_events::{Envelope, InMemoryTransport, QueueNames, Transport, UpdateBroadcaster};
use hopline_infra::{AuditStore, InMemoryAuditStore, InMemoryJobStore, JobLifecycle};
use hopline_router::compute::{codes, ComputeEndpoint, ComputeError, ComputeFailure, ComputeRequest};
use hopline_router::{
    ConsumerConfig, ConsumerHandle, FailureRetrier, MessageHandler, QueueConsumer, RetryPolicy,
    StageRouter, SuccessReporter,
};

type Answer = dyn Fn(&str, &Value) -> Result<Value, ComputeError> + Send + Sync;

/// Compute endpoint answering per stage and logging every call.
struct ScriptedCompute {
    answer: Box<Answer>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCompute {
    fn new(answer: impl Fn(&str, &Value) -> Result<Value, ComputeError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            answer: Box::new(answer),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeEndpoint for ScriptedCompute {
    async fn call(&self, request: &ComputeRequest) -> Result<Value, ComputeError> {
        let stage = request
            .route
            .as_ref()
            .and_then(|route| route.current_step())
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push(stage.clone());
        (self.answer)(&stage, &request.payload)
    }
}

struct Pipeline {
    transport: Arc<InMemoryTransport>,
    lifecycle: Arc<JobLifecycle<InMemoryJobStore>>,
    audit: Arc<InMemoryAuditStore>,
    queues: QueueNames,
    consumers: Vec<ConsumerHandle>,
}

fn consumer_config(queue: String) -> ConsumerConfig {
    ConsumerConfig::new(queue)
        .with_receive_wait(Duration::from_millis(50))
        .with_release_delay(Duration::from_millis(10))
}

impl Pipeline {
    fn new() -> Self {
        Self {
            transport: Arc::new(InMemoryTransport::new()),
            lifecycle: Arc::new(JobLifecycle::new(
                InMemoryJobStore::new(),
                Arc::new(UpdateBroadcaster::new(64)),
            )),
            audit: Arc::new(InMemoryAuditStore::new()),
            queues: QueueNames::default(),
            consumers: Vec::new(),
        }
    }

    fn run(&mut self, queue: String, handler: Arc<dyn MessageHandler>) {
        let handle = QueueConsumer::new(self.transport.clone(), handler, consumer_config(queue)).spawn();
        self.consumers.push(handle);
    }

    fn start(&mut self, stages: &[&str], compute: Arc<ScriptedCompute>, policy: RetryPolicy) {
        for stage in stages {
            let router = StageRouter::new(*stage, compute.clone(), self.queues.clone())
                .with_liveness(self.lifecycle.clone())
                .with_status(self.lifecycle.clone());
            self.run(self.queues.stage(stage), Arc::new(router));
        }
        let success = SuccessReporter::new(self.lifecycle.clone());
        self.run(self.queues.success(), Arc::new(success));
        let retrier = FailureRetrier::new(self.lifecycle.clone(), self.audit.clone(), self.queues.clone())
            .with_liveness(self.lifecycle.clone())
            .with_policy(policy);
        self.run(self.queues.failure(), Arc::new(retrier));
    }

    async fn submit(&self, id: &str, steps: &[&str], payload: Value) -> Job {
        let job = Job::new(JobId::parse(id).unwrap(), Route::new(steps.iter().copied()), payload);
        let job = self.lifecycle.create(job).await.unwrap();
        let first = self.queues.stage(steps[0]);
        let body = Envelope::for_job(&job).encode().unwrap();
        self.transport.publish(&first, &body).await.unwrap();
        job
    }

    async fn wait_terminal(&self, id: &JobId) -> Job {
        for _ in 0..20_000 {
            let job = self.lifecycle.require(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    async fn shutdown(self) {
        for consumer in self.consumers {
            consumer.shutdown().await;
        }
    }
}

fn fatal(message: &str) -> ComputeError {
    ComputeError::Remote(ComputeFailure::new(codes::PROCESSING, message))
}

#[tokio::test(start_paused = true)]
async fn two_stage_job_succeeds_with_the_last_result() {
    let compute = ScriptedCompute::new(|stage, payload| match stage {
        "parse" => Ok(json!({"x": payload["x"].as_i64().unwrap_or(0) + 1})),
        "infer" => Ok(json!({"y": payload["x"].as_i64().unwrap_or(0) + 1})),
        other => Err(fatal(&format!("unexpected stage {other}"))),
    });
    let mut pipeline = Pipeline::new();
    pipeline.start(&["parse", "infer"], compute.clone(), RetryPolicy::default());

    let job = pipeline.submit("j1", &["parse", "infer"], json!({"x": 1})).await;
    let done = pipeline.wait_terminal(&job.id).await;

    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.result, Some(json!({"y": 3})));
    assert_eq!(compute.calls(), vec!["parse", "infer"]);
    assert!(pipeline.audit.is_empty());

    let statuses: Vec<JobStatus> = pipeline
        .lifecycle
        .updates(&job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(statuses.first(), Some(&JobStatus::Pending));
    assert_eq!(statuses.last(), Some(&JobStatus::Succeeded));
    assert!(statuses.contains(&JobStatus::Running));
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_backs_off_then_fails_with_four_audit_records() {
    let compute = ScriptedCompute::new(|stage, payload| match stage {
        "parse" => Ok(payload.clone()),
        _ => Err(fatal("bad input")),
    });
    let mut pipeline = Pipeline::new();
    pipeline.start(&["parse", "infer"], compute.clone(), RetryPolicy::default());

    let started = tokio::time::Instant::now();
    let job = pipeline.submit("j2", &["parse", "infer"], json!({"x": 1})).await;
    let done = pipeline.wait_terminal(&job.id).await;
    let elapsed = started.elapsed();

    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("bad input"));
    // 5s + 10s + 20s of backoff, plus polling slack.
    assert!(elapsed >= Duration::from_secs(35), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(60), "elapsed {elapsed:?}");

    let records = pipeline.audit.for_job(&job.id).await.unwrap();
    assert_eq!(records.len(), 4);
    let counts: Vec<u32> = records.iter().map(|r| r.retry_count).collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);
    assert!(records[..3].iter().all(|r| !r.final_attempt));
    assert!(records[3].final_attempt);
    assert_eq!(records[3].retry_history.len(), 3);
    assert!(records.iter().all(|r| r.stage.as_deref() == Some("infer")));

    // The first stage ran once; only the failing stage was retried.
    assert_eq!(compute.calls(), vec!["parse", "infer", "infer", "infer", "infer"]);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stages_run_in_route_order_and_a_failure_skips_the_rest() {
    let compute = ScriptedCompute::new(|stage, payload| {
        let mut seen = payload.as_array().cloned().unwrap_or_default();
        seen.push(json!(stage));
        Ok(Value::Array(seen))
    });
    let mut pipeline = Pipeline::new();
    pipeline.start(&["a", "b", "c"], compute.clone(), RetryPolicy::default());

    let job = pipeline.submit("abc", &["a", "b", "c"], json!([])).await;
    let done = pipeline.wait_terminal(&job.id).await;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.result, Some(json!(["a", "b", "c"])));
    pipeline.shutdown().await;

    let failing = ScriptedCompute::new(|stage, payload| match stage {
        "b" => Err(fatal("b broke")),
        _ => Ok(payload.clone()),
    });
    let mut pipeline = Pipeline::new();
    let no_retries = RetryPolicy {
        max_retries: 0,
        ..RetryPolicy::default()
    };
    pipeline.start(&["a", "b", "c"], failing.clone(), no_retries);

    let job = pipeline.submit("abf", &["a", "b", "c"], json!({})).await;
    let done = pipeline.wait_terminal(&job.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("b broke"));
    assert_eq!(failing.calls(), vec!["a", "b"]);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_crashed_consumer_hands_its_message_to_the_next_one() {
    let compute = ScriptedCompute::new(|_, payload| Ok(payload.clone()));
    let mut pipeline = Pipeline::new();
    let job = pipeline.submit("crash", &["parse"], json!({"k": "v"})).await;
    let queue = pipeline.queues.stage("parse");

    // A consumer takes the message and dies before publishing anything.
    let taken = pipeline
        .transport
        .receive(&queue, 1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(pipeline.transport.requeue_in_flight(&queue), 1);

    pipeline.start(&["parse"], compute.clone(), RetryPolicy::default());
    let done = pipeline.wait_terminal(&job.id).await;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.result, Some(json!({"k": "v"})));

    // A duplicate success message is consumed without a second transition.
    let duplicate = Envelope::for_job(&job).complete(json!({"k": "other"})).encode().unwrap();
    pipeline
        .transport
        .publish(&pipeline.queues.success(), &duplicate)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let terminal = pipeline
        .lifecycle
        .updates(&job.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.is_terminal())
        .count();
    assert_eq!(terminal, 1);
    assert_eq!(
        pipeline.lifecycle.require(&job.id).await.unwrap().result,
        Some(json!({"k": "v"}))
    );
    assert_eq!(pipeline.transport.ready_len(&pipeline.queues.success()), 0);
    pipeline.shutdown().await;
}
