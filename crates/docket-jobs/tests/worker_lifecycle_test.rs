//! Worker loop tests: execution, retry and failure bookkeeping, dispatch,
//! and stopping.

mod common;

use async_trait::async_trait;
use common::{options, CompletingHandler, FailingHandler, Harness, RecordingListener};
use docket_config::{AdmissionMode, ConnectionConfig, DispatchMode};
use docket_core::DocumentId;
use docket_jobs::{
    CommandTemplate, ErrorReporter, FailedJobProvider, JobError, JobHandle, JobHandler, JobResult,
    MemoryProbe, Payload, ProcessCommand, ProcessLauncher, StopHandle, WorkerListener,
};
use mockall::mock;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

mock! {
    Launcher {}

    #[async_trait]
    impl ProcessLauncher for Launcher {
        async fn launch(&self, command: &ProcessCommand) -> JobResult<()>;
    }
}

struct FixedProbe(u64);

impl MemoryProbe for FixedProbe {
    fn resident_mib(&self) -> Option<u64> {
        Some(self.0)
    }
}

#[derive(Default)]
struct RecordingReporter {
    errors: Mutex<Vec<String>>,
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: &JobError) {
        self.errors.lock().push(error.to_string());
    }
}

struct StopAfter {
    stop: StopHandle,
    after: usize,
    seen: AtomicUsize,
}

impl WorkerListener for StopAfter {
    fn after_job(&self, _connection: &str, _job: &JobHandle) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.stop.request_stop(0);
        }
    }
}

struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn handle(&self, _job: &mut JobHandle, _data: Value) -> JobResult<()> {
        Ok(())
    }
}

struct DeleteThenFail;

#[async_trait]
impl JobHandler for DeleteThenFail {
    async fn handle(&self, job: &mut JobHandle, _data: Value) -> JobResult<()> {
        job.delete().await?;
        Err(JobError::handler("failed after delete"))
    }
}

struct RejectInput {
    then_error: bool,
}

#[async_trait]
impl JobHandler for RejectInput {
    async fn handle(&self, job: &mut JobHandle, _data: Value) -> JobResult<()> {
        job.mark_failed("bad input").await?;
        if self.then_error {
            Err(JobError::handler("rejected"))
        } else {
            Ok(())
        }
    }
}

struct SlowHandler;

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _job: &mut JobHandle, _data: Value) -> JobResult<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct BlockingHandler {
    started: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn handle(&self, _job: &mut JobHandle, _data: Value) -> JobResult<()> {
        if let Some(started) = self.started.lock().take() {
            let _ = started.send(());
        }
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn work(n: u32) -> Payload {
    Payload::new("work", json!({ "n": n }))
}

#[tokio::test]
async fn test_successful_job_deleted_by_handler() {
    let h = Harness::new();
    let handler = Arc::new(CompletingHandler::default());
    h.handlers.register("work", handler.clone());
    let listener = Arc::new(RecordingListener::default());
    let worker = h.worker().with_listener(listener.clone());

    let id = h.queue().push(&work(7), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &options(3)).await.unwrap();

    assert!(job.is_deleted());
    assert_eq!(h.queue().size(None).await.unwrap(), 0);
    assert_eq!(*handler.seen.lock(), vec![json!({"n": 7})]);
    assert_eq!(worker.jobs_processed(), 1);
    assert_eq!(
        listener.events(),
        vec![format!("before_job:{id}"), format!("after_job:{id}")]
    );
}

#[tokio::test]
async fn test_successful_job_not_force_deleted() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(NoopHandler));
    let worker = h.worker();

    h.queue().push(&work(1), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &options(3)).await.unwrap();

    assert!(!job.is_terminal());
    assert_eq!(h.queue().reserved_count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retries_until_max_tries_then_fails_once() {
    let h = Harness::new();
    let failing = Arc::new(FailingHandler::default());
    h.handlers.register("work", failing.clone());
    let listener = Arc::new(RecordingListener::default());
    let worker = h.worker().with_listener(listener.clone());
    let opts = options(3);

    let payload = work(1);
    let id = h.queue().push(&payload, None).await.unwrap();

    for attempt in 1..=3 {
        let mut job = h.reserve_next("default").await.expect("job visible");
        assert_eq!(job.id(), id);
        assert_eq!(job.attempts(), attempt);

        let err = worker.process(&mut job, &opts).await.unwrap_err();
        assert!(matches!(err, JobError::Handler(_)));

        if attempt < 3 {
            assert!(job.is_released());
            let stored = h.queue().get_by_id(id).await.unwrap().unwrap();
            assert_eq!(stored.attempts(), attempt);
            assert!(!stored.is_reserved());
        } else {
            assert!(job.has_failed());
        }
    }

    assert_eq!(failing.calls(), 3);
    assert_eq!(h.queue().size(None).await.unwrap(), 0);
    assert!(h.queue().get_by_id(id).await.unwrap().is_none());

    let failed = h.failer.all().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].connection, "default");
    assert_eq!(failed[0].queue, "default");
    assert_eq!(failed[0].payload, payload.to_raw().unwrap());
    assert!(failed[0].exception.contains("boom"));

    assert_eq!(listener.count("before_job"), 3);
    assert_eq!(listener.count("exception_occurred"), 2);
    assert_eq!(listener.count("job_failed"), 1);
    assert_eq!(listener.count("after_job"), 0);
    assert_eq!(worker.jobs_failed(), 1);
}

#[tokio::test]
async fn test_release_honors_delay() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(FailingHandler::default()));
    let worker = h.worker();
    let opts = docket_jobs::WorkerOptions {
        delay: 5,
        ..options(3)
    };

    h.queue().push(&work(1), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &opts).await.unwrap_err();

    assert!(h.queue().pop("default").await.unwrap().is_none());
    h.clock.advance_secs(5);
    let again = h.queue().pop("default").await.unwrap().expect("visible after delay");
    assert_eq!(again.attempts(), 1);
}

#[tokio::test]
async fn test_ceiling_checked_before_running() {
    let h = Harness::new();
    let failing = Arc::new(FailingHandler::default());
    h.handlers.register("work", failing.clone());
    let listener = Arc::new(RecordingListener::default());
    let worker = h.worker().with_listener(listener.clone());
    let opts = options(2);

    let id = h.queue().push(&work(1), None).await.unwrap();

    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &opts).await.unwrap_err();

    // Second reservation is abandoned without running, as if the worker died.
    let crashed = h.reserve_next("default").await.unwrap();
    assert_eq!(crashed.attempts(), 2);
    drop(crashed);
    h.clock.advance_secs(60);

    let mut job = h.reserve_next("default").await.unwrap();
    assert_eq!(job.attempts(), 3);
    let err = worker.process(&mut job, &opts).await.unwrap_err();

    assert!(matches!(
        err,
        JobError::MaxAttemptsExceeded {
            attempts: 3,
            max_tries: 2
        }
    ));
    assert_eq!(failing.calls(), 1);
    assert!(h.queue().get_by_id(id).await.unwrap().is_none());

    let failed = h.failer.all().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].exception.contains("attempted too many times"));
    assert_eq!(listener.count("job_failed"), 1);
    assert_eq!(listener.count("exception_occurred"), 1);
}

#[tokio::test]
async fn test_payload_max_tries_overrides_worker() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(FailingHandler::default()));
    let worker = h.worker();

    h.queue().push(&work(1).with_max_tries(1), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &options(5)).await.unwrap_err();

    assert!(job.has_failed());
    assert_eq!(h.failer.all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_zero_max_tries_retries_forever() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(FailingHandler::default()));
    let worker = h.worker();
    let opts = options(0);

    h.queue().push(&work(1), None).await.unwrap();
    for _ in 0..5 {
        let mut job = h.reserve_next("default").await.unwrap();
        worker.process(&mut job, &opts).await.unwrap_err();
        assert!(job.is_released());
    }

    let job = h.queue().pop("default").await.unwrap().unwrap();
    assert_eq!(job.attempts(), 5);
    assert!(h.failer.all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_handler_fails_job() {
    let h = Harness::new();
    let worker = h.worker();

    h.queue().push(&Payload::new("unknown", Value::Null), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    let err = worker.process(&mut job, &options(1)).await.unwrap_err();

    assert!(matches!(err, JobError::HandlerNotFound(ref name) if name == "unknown"));
    let failed = h.failer.all().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].exception.contains("unknown"));
}

#[tokio::test]
async fn test_handler_deleted_job_is_not_released() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(DeleteThenFail));
    let listener = Arc::new(RecordingListener::default());
    let worker = h.worker().with_listener(listener.clone());

    h.queue().push(&work(1), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &options(3)).await.unwrap_err();

    assert!(job.is_deleted());
    assert!(!job.is_released());
    assert_eq!(h.queue().size(None).await.unwrap(), 0);
    assert_eq!(listener.count("exception_occurred"), 1);
}

#[tokio::test]
async fn test_handler_marked_failure_is_logged() {
    for then_error in [true, false] {
        let h = Harness::new();
        h.handlers.register("work", Arc::new(RejectInput { then_error }));
        let listener = Arc::new(RecordingListener::default());
        let worker = h.worker().with_listener(listener.clone());

        h.queue().push(&work(1), None).await.unwrap();
        let mut job = h.reserve_next("default").await.unwrap();
        let result = worker.process(&mut job, &options(3)).await;
        assert_eq!(result.is_err(), then_error);

        assert!(job.has_failed());
        assert!(!job.is_released());
        assert_eq!(h.queue().size(None).await.unwrap(), 0);

        let failed = h.failer.all().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].exception, "bad input");
        assert_eq!(failed[0].payload, job.raw_payload());
        assert_eq!(listener.count("job_failed"), 1);
        assert_eq!(listener.count("exception_occurred"), 0);
        assert_eq!(listener.count("after_job"), 0);
        assert_eq!(worker.jobs_failed(), 1);
    }
}

#[tokio::test]
async fn test_terminal_handle_never_logged_twice() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(DeleteThenFail));
    let worker = h.worker();

    h.queue().push(&work(1), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    worker.process(&mut job, &options(1)).await.unwrap_err();

    assert!(job.is_deleted());
    assert!(!job.has_failed());
    assert!(h.failer.all().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_is_a_failure() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(SlowHandler));
    let worker = h.worker();
    let opts = docket_jobs::WorkerOptions {
        timeout: 1,
        ..options(1)
    };

    h.queue().push(&work(1), None).await.unwrap();
    let mut job = h.reserve_next("default").await.unwrap();
    let err = worker.process(&mut job, &opts).await.unwrap_err();

    assert!(matches!(err, JobError::Timeout(1)));
    let failed = h.failer.all().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].exception.contains("timed out"));
}

#[tokio::test]
async fn test_daemon_processes_until_stopped() {
    let h = Harness::new();
    let handler = Arc::new(CompletingHandler::default());
    h.handlers.register("work", handler.clone());
    let listener = Arc::new(RecordingListener::default());

    let worker = h.worker();
    let stop = worker.stop_handle();
    let worker = worker.with_listener(listener.clone()).with_listener(Arc::new(StopAfter {
        stop,
        after: 3,
        seen: AtomicUsize::new(0),
    }));

    h.queue()
        .bulk(&[work(1), work(2), work(3)], None)
        .await
        .unwrap();

    let exit = worker.daemon("default", "default", &options(1)).await.unwrap();

    assert_eq!(exit.status, 0);
    assert!(!exit.forced);
    assert_eq!(worker.jobs_processed(), 3);
    assert_eq!(h.queue().size(None).await.unwrap(), 0);
    assert_eq!(
        *handler.seen.lock(),
        vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
    );
    assert_eq!(listener.events().last().unwrap(), "worker_stopping:0");
}

#[tokio::test]
async fn test_daemon_unknown_connection() {
    let h = Harness::new();
    let err = h
        .worker()
        .daemon("missing", "default", &options(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn test_force_kill_abandons_running_job() {
    let h = Harness::new();
    let (started_tx, started_rx) = oneshot::channel();
    h.handlers.register(
        "work",
        Arc::new(BlockingHandler {
            started: Mutex::new(Some(started_tx)),
        }),
    );

    let worker = Arc::new(h.worker());
    let stop = worker.stop_handle();
    h.queue().push(&work(1), None).await.unwrap();

    let task = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.daemon("default", "default", &options(1)).await }
    });

    started_rx.await.unwrap();
    stop.force_kill(9);
    let exit = task.await.unwrap().unwrap();

    assert_eq!(exit.status, 9);
    assert!(exit.forced);
    assert_eq!(h.queue().reserved_count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_memory_ceiling_stops_worker() {
    let h = Harness::new();
    let listener = Arc::new(RecordingListener::default());
    let worker = h
        .worker()
        .with_listener(listener.clone())
        .with_memory_probe(Arc::new(FixedProbe(512)));
    let opts = docket_jobs::WorkerOptions {
        memory: 128,
        ..options(1)
    };

    let exit = worker.daemon("default", "default", &opts).await.unwrap();

    assert_eq!(exit.status, 0);
    assert!(!exit.forced);
    assert_eq!(listener.events(), vec!["worker_stopping:0".to_string()]);
}

#[tokio::test]
async fn test_lost_connection_stops_worker_when_enabled() {
    let h = Harness::new();
    let reporter = Arc::new(RecordingReporter::default());
    let worker = h.worker().with_reporter(reporter.clone());
    let opts = docket_jobs::WorkerOptions {
        stop_on_connection_lost: true,
        ..options(1)
    };

    h.store.set_online(false);
    let exit = worker.daemon("default", "default", &opts).await.unwrap();

    assert_eq!(exit.status, 0);
    let errors = reporter.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("no connection to the server"));
}

#[tokio::test(start_paused = true)]
async fn test_admission_denied_leaves_job_claimable() {
    let h = Harness::with_connection(ConnectionConfig {
        limit: 1,
        admission: AdmissionMode::Queue,
        ..ConnectionConfig::default()
    });
    let failing = Arc::new(FailingHandler::default());
    h.handlers.register("work", failing.clone());

    h.queue().push(&work(1), None).await.unwrap();
    let waiting = h.queue().push(&work(2), None).await.unwrap();
    let _held = h.reserve_next("default").await.unwrap();

    let worker = h.worker().with_memory_probe(Arc::new(FixedProbe(512)));
    let opts = docket_jobs::WorkerOptions {
        memory: 128,
        ..options(1)
    };
    worker.daemon("default", "default", &opts).await.unwrap();

    assert_eq!(failing.calls(), 0);
    let job = h.queue().pop("default").await.unwrap().expect("job not held");
    assert_eq!(job.id(), waiting);
    assert_eq!(job.attempts(), 0);
}

#[tokio::test]
async fn test_process_dispatch_launches_child_without_running() {
    let h = Harness::with_connection(ConnectionConfig {
        dispatch: DispatchMode::Process,
        ..ConnectionConfig::default()
    });
    let failing = Arc::new(FailingHandler::default());
    h.handlers.register("work", failing.clone());

    let id = h.queue().push(&work(1), Some("mail")).await.unwrap();

    let worker = h.worker();
    let stop = worker.stop_handle();
    let expected_id = format!("--id={id}");

    let mut launcher = MockLauncher::new();
    launcher
        .expect_launch()
        .withf(move |cmd: &ProcessCommand| {
            cmd.binary == "/usr/local/bin/docket-worker"
                && cmd.args
                    == vec![
                        "process-job".to_string(),
                        expected_id.clone(),
                        "--connection=default".to_string(),
                        "--queue=mail".to_string(),
                    ]
        })
        .times(1)
        .returning(move |_| {
            stop.request_stop(0);
            Ok(())
        });

    let worker = worker
        .with_launcher(Arc::new(launcher))
        .with_command(CommandTemplate::new("/usr/local/bin/docket-worker"));

    let exit = worker.daemon("default", "mail", &options(1)).await.unwrap();
    assert_eq!(exit.status, 0);

    assert_eq!(failing.calls(), 0);
    let stored = h.queue().get_by_id(id).await.unwrap().unwrap();
    assert!(stored.is_reserved());
    assert_eq!(stored.attempts(), 1);
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let h = Harness::with_connection(ConnectionConfig {
        dispatch: DispatchMode::Process,
        ..ConnectionConfig::default()
    });
    h.queue().push(&work(1), None).await.unwrap();

    let worker = h.worker();
    let stop = worker.stop_handle();
    let reporter = Arc::new(RecordingReporter::default());

    let mut launcher = MockLauncher::new();
    launcher.expect_launch().times(1).returning(move |_| {
        stop.request_stop(0);
        Err(JobError::Spawn("sh: not found".to_string()))
    });

    let worker = worker
        .with_launcher(Arc::new(launcher))
        .with_reporter(reporter.clone());
    worker.daemon("default", "default", &options(1)).await.unwrap();

    assert_eq!(reporter.errors.lock().len(), 1);
    assert!(reporter.errors.lock()[0].contains("sh: not found"));
}

#[tokio::test]
async fn test_run_job_by_id_completes_reserved_job() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(CompletingHandler::default()));
    let worker = h.worker();

    let id = h.queue().push(&work(1), None).await.unwrap();
    let _parent = h.reserve_next("default").await.unwrap();

    worker
        .run_job_by_id("default", id, Some("default"), &options(1))
        .await
        .unwrap();
    assert_eq!(h.queue().size(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_run_job_by_id_releases_on_failure() {
    let h = Harness::new();
    h.handlers.register("work", Arc::new(FailingHandler::default()));
    let worker = h.worker();

    let id = h.queue().push(&work(1), None).await.unwrap();
    let _parent = h.reserve_next("default").await.unwrap();

    let err = worker
        .run_job_by_id("default", id, None, &options(3))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Handler(_)));

    let job = h.queue().pop("default").await.unwrap().expect("released");
    assert_eq!(job.attempts(), 1);
}

#[tokio::test]
async fn test_run_job_by_id_unknown_job() {
    let h = Harness::new();
    let err = h
        .worker()
        .run_job_by_id("default", DocumentId::new(), None, &options(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
}

#[tokio::test]
async fn test_run_job_by_id_rejects_other_queue() {
    let h = Harness::new();
    let handler = Arc::new(CompletingHandler::default());
    h.handlers.register("work", handler.clone());
    let reporter = Arc::new(RecordingReporter::default());
    let worker = h.worker().with_reporter(reporter.clone());

    let id = h.queue().push(&work(1), Some("mail")).await.unwrap();
    let _parent = h.reserve_next("mail").await.unwrap();

    let err = worker
        .run_job_by_id("default", id, Some("default"), &options(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        JobError::QueueMismatch { ref expected, ref actual, .. }
            if expected == "default" && actual == "mail"
    ));

    assert!(handler.seen.lock().is_empty());
    assert_eq!(h.queue().size(Some("mail")).await.unwrap(), 1);
    assert_eq!(h.queue().reserved_count(Some("mail")).await.unwrap(), 1);
    assert_eq!(reporter.errors.lock().len(), 1);
}
