//! The worker loop.
//!
//! One worker runs one polling loop against one connection. Every iteration
//! claims at most one job, reserves it, and either runs it inline or hands
//! it to a detached child process. Errors never escape the loop; they go to
//! the [`ErrorReporter`] and the loop keeps polling.

use crate::dispatch::{CommandTemplate, ProcessLauncher, ShellLauncher};
use crate::error::{JobError, JobResult};
use crate::events::{WorkerEvents, WorkerListener};
use crate::failed::FailedJobProvider;
use crate::handler::HandlerRegistry;
use crate::job::JobHandle;
use crate::manager::QueueManager;
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::options::WorkerOptions;
use crate::probe::{MemoryProbe, ProcMemoryProbe};
use crate::queue::DocumentQueue;
use crate::reporter::{ErrorReporter, TracingReporter};
use docket_config::DispatchMode;
use docket_core::DocumentId;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, info_span, warn, Instrument};

/// Pause after admission control turns a job away.
pub const ADMISSION_BACKOFF: Duration = Duration::from_secs(1);

/// How the daemon loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonExit {
    /// Exit status for the process.
    pub status: i32,
    /// The stop was a forced kill rather than a graceful stop.
    pub forced: bool,
}

struct StopState {
    should_quit: AtomicBool,
    forced: AtomicBool,
    status: AtomicI32,
    signal: broadcast::Sender<()>,
}

/// Requests a running daemon to stop. Cheap to clone.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<StopState>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    /// Creates a handle with no stop pending.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(4);
        Self {
            state: Arc::new(StopState {
                should_quit: AtomicBool::new(false),
                forced: AtomicBool::new(false),
                status: AtomicI32::new(0),
                signal,
            }),
        }
    }

    /// Asks the loop to stop at the top of its next iteration.
    ///
    /// An in-flight job runs to completion first. An idle pause is cut short.
    pub fn request_stop(&self, status: i32) {
        if self.is_forced() {
            return;
        }
        self.state.status.store(status, Ordering::SeqCst);
        self.state.should_quit.store(true, Ordering::SeqCst);
        let _ = self.state.signal.send(());
    }

    /// Stops the loop immediately, abandoning any in-flight job.
    ///
    /// An abandoned job stays reserved until its visibility timeout expires.
    pub fn force_kill(&self, status: i32) {
        self.state.status.store(status, Ordering::SeqCst);
        self.state.forced.store(true, Ordering::SeqCst);
        self.state.should_quit.store(true, Ordering::SeqCst);
        let _ = self.state.signal.send(());
    }

    /// Whether any stop is pending.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.state.should_quit.load(Ordering::SeqCst)
    }

    /// Whether a forced kill is pending.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.state.forced.load(Ordering::SeqCst)
    }

    fn exit(&self) -> DaemonExit {
        DaemonExit {
            status: self.state.status.load(Ordering::SeqCst),
            forced: self.is_forced(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.state.signal.subscribe()
    }

    async fn killed(&self, rx: &mut broadcast::Receiver<()>) {
        loop {
            if self.is_forced() {
                return;
            }
            match rx.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }
}

enum LoopStep {
    Worked,
    Idle(Duration),
}

/// Polls a connection and executes or dispatches its jobs.
pub struct Worker {
    manager: Arc<QueueManager>,
    handlers: Arc<HandlerRegistry>,
    failer: Arc<dyn FailedJobProvider>,
    events: WorkerEvents,
    reporter: Arc<dyn ErrorReporter>,
    launcher: Arc<dyn ProcessLauncher>,
    command: CommandTemplate,
    memory: Arc<dyn MemoryProbe>,
    stop: StopHandle,
    jobs_processed: AtomicU64,
    jobs_failed: AtomicU64,
}

impl Worker {
    /// Creates a worker with tracing-based reporting and shell launching.
    pub fn new(
        manager: Arc<QueueManager>,
        handlers: Arc<HandlerRegistry>,
        failer: Arc<dyn FailedJobProvider>,
    ) -> Self {
        Self {
            manager,
            handlers,
            failer,
            events: WorkerEvents::default(),
            reporter: Arc::new(TracingReporter),
            launcher: Arc::new(ShellLauncher::default()),
            command: CommandTemplate::default(),
            memory: Arc::new(ProcMemoryProbe),
            stop: StopHandle::new(),
            jobs_processed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        }
    }

    /// Replaces the lifecycle listeners.
    #[must_use]
    pub fn with_events(mut self, events: WorkerEvents) -> Self {
        self.events = events;
        self
    }

    /// Adds one lifecycle listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn WorkerListener>) -> Self {
        self.events = self.events.with_listener(listener);
        self
    }

    /// Replaces the error reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replaces the child process launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Sets the child command line template.
    #[must_use]
    pub fn with_command(mut self, command: CommandTemplate) -> Self {
        self.command = command;
        self
    }

    /// Replaces the memory probe.
    #[must_use]
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Handle for stopping the daemon from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Jobs whose handler returned normally.
    #[must_use]
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    /// Jobs moved to the failure log.
    #[must_use]
    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Runs the polling loop until a stop is requested.
    ///
    /// `queue` is a comma-separated list; earlier queues are drained first.
    /// Fails only if the connection is not configured.
    pub async fn daemon(
        &self,
        connection: &str,
        queue: &str,
        options: &WorkerOptions,
    ) -> JobResult<DaemonExit> {
        let store = self.manager.connection(Some(connection))?;
        let connection = store.connection_name().to_string();

        info!(
            connection = %connection,
            queues = %queue,
            dispatch = ?store.dispatch_mode(),
            max_tries = options.max_tries,
            "Worker started"
        );
        WorkerMetrics::set_running(&connection, true);

        loop {
            let mut stop_rx = self.stop.subscribe();
            if self.stop.is_stop_requested() {
                return Ok(self.stop_worker(&connection));
            }

            let step = tokio::select! {
                biased;
                () = self.stop.killed(&mut stop_rx) => {
                    warn!(connection = %connection, "Worker killed during a job");
                    return Ok(self.stop_worker(&connection));
                }
                step = self.run_next_job(&store, queue, options) => step,
            };

            if let LoopStep::Idle(pause) = step {
                self.pause(pause, &mut stop_rx).await;
            }

            if self.memory.exceeds(options.memory) {
                warn!(
                    connection = %connection,
                    limit_mib = options.memory,
                    "Memory limit reached, stopping worker"
                );
                self.stop.request_stop(0);
            }
        }
    }

    /// Processes one job by id, outside the polling loop.
    ///
    /// Entry point of the `process-job` command. When `queue` is given the
    /// record must be on that queue. Errors go to the reporter before being
    /// returned. Sleeps `options.sleep` afterwards whatever the outcome.
    pub async fn run_job_by_id(
        &self,
        connection: &str,
        id: DocumentId,
        queue: Option<&str>,
        options: &WorkerOptions,
    ) -> JobResult<()> {
        let store = self.manager.connection(Some(connection))?;

        let result = match store.get_by_id(id).await {
            Ok(Some(job)) if queue.is_some_and(|queue| queue != job.queue()) => {
                Err(JobError::QueueMismatch {
                    id: id.to_string(),
                    expected: queue.unwrap_or_default().to_string(),
                    actual: job.queue().to_string(),
                })
            }
            Ok(Some(mut job)) => self.process(&mut job, options).await,
            Ok(None) => Err(JobError::NotFound(id.to_string())),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.report(store.connection_name(), e, options);
        }

        tokio::time::sleep(options.sleep_duration()).await;
        result
    }

    /// Runs a reserved job inline and settles it.
    ///
    /// Handler errors are re-raised after the job was released or failed.
    pub async fn process(&self, job: &mut JobHandle, options: &WorkerOptions) -> JobResult<()> {
        let connection = job.connection().to_string();
        let span = info_span!(
            "job",
            connection = %connection,
            queue = %job.queue(),
            job_id = %job.id(),
            attempts = job.attempts()
        );

        async move {
            self.events.before_job(&connection, job);

            let max_tries = job
                .payload()
                .ok()
                .and_then(|payload| payload.max_tries)
                .unwrap_or(options.max_tries);

            // Reclaims after a visibility timeout bump attempts without running
            // the handler, so the ceiling is checked before every run.
            if max_tries > 0 && job.attempts() > max_tries {
                let error = JobError::MaxAttemptsExceeded {
                    attempts: job.attempts(),
                    max_tries,
                };
                if let Err(e) = self.fail_job(&connection, job, &error).await {
                    self.report(&connection, &e, options);
                }
                return Err(error);
            }

            let started = Instant::now();
            let result = self.fire(job, options).await;

            if job.has_failed() {
                if let Err(e) = self
                    .log_handler_failure(&connection, job, result.as_ref().err())
                    .await
                {
                    self.report(&connection, &e, options);
                }
            }

            match result {
                Ok(()) if job.has_failed() => Ok(()),
                Ok(()) => {
                    JobMetrics::job_processed(&connection, job.queue(), started.elapsed());
                    self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                    self.events.after_job(&connection, job);
                    Ok(())
                }
                Err(error) => {
                    JobMetrics::job_errored(&connection, job.queue(), started.elapsed());
                    self.handle_job_exception(&connection, job, max_tries, options, error)
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_next_job(
        &self,
        store: &Arc<DocumentQueue>,
        queue: &str,
        options: &WorkerOptions,
    ) -> LoopStep {
        let connection = store.connection_name();

        let mut job = match store.pop(queue).await {
            Ok(Some(job)) => job,
            Ok(None) => return LoopStep::Idle(options.sleep_duration()),
            Err(e) => {
                self.report(connection, &e, options);
                return LoopStep::Idle(options.sleep_duration());
            }
        };

        match store.can_admit(&job).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(connection = %connection, job_id = %job.id(), "Admission limit reached");
                WorkerMetrics::admission_denied(connection, job.queue());
                if let Err(e) = store.unclaim(&mut job).await {
                    self.report(connection, &e, options);
                }
                return LoopStep::Idle(ADMISSION_BACKOFF);
            }
            Err(e) => {
                self.report(connection, &e, options);
                return LoopStep::Idle(options.sleep_duration());
            }
        }

        match store.mark_reserved(&mut job).await {
            Ok(true) => {}
            Ok(false) => return LoopStep::Worked,
            Err(e) => {
                self.report(connection, &e, options);
                return LoopStep::Idle(options.sleep_duration());
            }
        }

        match store.dispatch_mode() {
            DispatchMode::Inline => {
                if let Err(e) = self.process(&mut job, options).await {
                    self.report(connection, &e, options);
                }
            }
            DispatchMode::Process => self.launch(connection, &job, options).await,
        }

        LoopStep::Worked
    }

    async fn launch(&self, connection: &str, job: &JobHandle, options: &WorkerOptions) {
        let command = self.command.for_job(job.id(), connection, job.queue());
        match self.launcher.launch(&command).await {
            Ok(()) => {
                WorkerMetrics::process_launched(connection);
                debug!(connection = %connection, job_id = %job.id(), "Dispatched job to child process");
            }
            Err(e) => self.report(connection, &e, options),
        }
    }

    async fn fire(&self, job: &mut JobHandle, options: &WorkerOptions) -> JobResult<()> {
        let payload = job.payload()?;
        let handler = self
            .handlers
            .get(&payload.job)
            .ok_or_else(|| JobError::HandlerNotFound(payload.job.clone()))?;

        handler.prepare().await?;

        let Some(limit) = options.handler_timeout() else {
            return handler.handle(job, payload.data).await;
        };

        let connection = job.connection().to_string();
        let queue = job.queue().to_string();
        match tokio::time::timeout(limit, handler.handle(job, payload.data)).await {
            Ok(result) => result,
            Err(_) => {
                JobMetrics::job_timed_out(&connection, &queue);
                Err(JobError::Timeout(options.timeout))
            }
        }
    }

    async fn handle_job_exception(
        &self,
        connection: &str,
        job: &mut JobHandle,
        max_tries: u32,
        options: &WorkerOptions,
        error: JobError,
    ) -> JobResult<()> {
        if !job.has_failed() && max_tries > 0 && job.attempts() >= max_tries {
            if let Err(e) = self.fail_job(connection, job, &error).await {
                self.report(connection, &e, options);
            }
        } else if !job.has_failed() {
            self.events.exception_occurred(connection, job, &error);
            if !job.is_terminal() {
                if let Err(e) = job.release(options.delay).await {
                    self.report(connection, &e, options);
                }
            }
        }

        Err(error)
    }

    /// Records a job the handler marked failed itself.
    async fn log_handler_failure(
        &self,
        connection: &str,
        job: &JobHandle,
        error: Option<&JobError>,
    ) -> JobResult<()> {
        let reason = job
            .failure_reason()
            .map(str::to_string)
            .or_else(|| error.map(ToString::to_string))
            .unwrap_or_default();
        self.failer
            .log(connection, job.queue(), job.raw_payload(), &reason)
            .await?;

        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        let error = JobError::Handler(reason);
        self.events.job_failed(connection, job, &error);
        Ok(())
    }

    async fn fail_job(
        &self,
        connection: &str,
        job: &mut JobHandle,
        error: &JobError,
    ) -> JobResult<()> {
        if job.is_terminal() {
            return Ok(());
        }

        let reason = error.to_string();
        job.mark_failed(reason.clone()).await?;
        self.failer
            .log(connection, job.queue(), job.raw_payload(), &reason)
            .await?;

        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.events.job_failed(connection, job, error);
        Ok(())
    }

    fn report(&self, connection: &str, error: &JobError, options: &WorkerOptions) {
        self.reporter.report(error);
        WorkerMetrics::worker_error(connection);

        if options.stop_on_connection_lost && error.is_connection_lost() {
            warn!(connection = %connection, error = %error, "Lost store connection, stopping worker");
            self.stop.request_stop(0);
        }
    }

    async fn pause(&self, duration: Duration, stop_rx: &mut broadcast::Receiver<()>) {
        if self.stop.is_stop_requested() {
            return;
        }
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            _ = stop_rx.recv() => {}
        }
    }

    fn stop_worker(&self, connection: &str) -> DaemonExit {
        let exit = self.stop.exit();
        self.events.worker_stopping(exit.status);
        WorkerMetrics::set_running(connection, false);

        info!(
            connection = %connection,
            status = exit.status,
            forced = exit.forced,
            processed = self.jobs_processed(),
            failed = self.jobs_failed(),
            "Worker stopped"
        );
        exit
    }
}
