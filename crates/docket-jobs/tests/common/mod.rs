//! Shared fixtures for queue and worker tests.
//!
//! Everything runs against the in-memory store with a manual clock, so
//! delays and visibility timeouts are driven by advancing the clock.

#![allow(dead_code)]

use async_trait::async_trait;
use docket_config::{AppConfig, ConnectionConfig};
use docket_core::ManualClock;
use docket_jobs::{
    DocumentFailedJobProvider, DocumentQueue, HandlerRegistry, JobError, JobHandle, JobHandler,
    JobResult, QueueManager, Worker, WorkerListener, WorkerOptions,
};
use docket_store::MemoryDocumentStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const START: i64 = 1_700_000_000;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryDocumentStore>,
    pub manager: Arc<QueueManager>,
    pub failer: Arc<DocumentFailedJobProvider>,
    pub handlers: Arc<HandlerRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_connection(ConnectionConfig::default())
    }

    pub fn with_connection(connection: ConnectionConfig) -> Self {
        let mut config = AppConfig::default();
        config.connections.insert("default".to_string(), connection);

        let clock = Arc::new(ManualClock::at_unix(START));
        let store = Arc::new(MemoryDocumentStore::new());
        let manager = Arc::new(QueueManager::new(&config, store.clone(), clock.clone()));
        let failer = Arc::new(DocumentFailedJobProvider::new(
            store.clone(),
            clock.clone(),
            config.failed.table.clone(),
        ));

        Self {
            clock,
            store,
            manager,
            failer,
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    pub fn queue(&self) -> Arc<DocumentQueue> {
        self.manager.connection(None).unwrap()
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.manager.clone(), self.handlers.clone(), self.failer.clone())
    }

    /// Claims and reserves the next job on `queue`, as one loop iteration does.
    pub async fn reserve_next(&self, queue: &str) -> Option<JobHandle> {
        let store = self.queue();
        let mut job = store.pop(queue).await.unwrap()?;
        assert!(store.mark_reserved(&mut job).await.unwrap());
        Some(job)
    }
}

/// Worker options for tests: no idle sleep and no memory ceiling.
pub fn options(max_tries: u32) -> WorkerOptions {
    WorkerOptions {
        delay: 0,
        memory: u64::MAX,
        timeout: 5,
        sleep: 0,
        max_tries,
        stop_on_connection_lost: false,
    }
}

/// Always fails, counting its calls.
#[derive(Default)]
pub struct FailingHandler {
    pub calls: AtomicU32,
}

impl FailingHandler {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _job: &mut JobHandle, _data: Value) -> JobResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(JobError::handler("boom"))
    }
}

/// Deletes the job and records the arguments it was given.
#[derive(Default)]
pub struct CompletingHandler {
    pub seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl JobHandler for CompletingHandler {
    async fn handle(&self, job: &mut JobHandle, data: Value) -> JobResult<()> {
        self.seen.lock().push(data);
        job.delete().await
    }
}

/// Records every lifecycle event as `name:job_id`.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.split(':').next() == Some(name))
            .count()
    }
}

impl WorkerListener for RecordingListener {
    fn before_job(&self, _connection: &str, job: &JobHandle) {
        self.events.lock().push(format!("before_job:{}", job.id()));
    }

    fn after_job(&self, _connection: &str, job: &JobHandle) {
        self.events.lock().push(format!("after_job:{}", job.id()));
    }

    fn exception_occurred(&self, _connection: &str, job: &JobHandle, _error: &JobError) {
        self.events.lock().push(format!("exception_occurred:{}", job.id()));
    }

    fn job_failed(&self, _connection: &str, job: &JobHandle, _error: &JobError) {
        self.events.lock().push(format!("job_failed:{}", job.id()));
    }

    fn worker_stopping(&self, status: i32) {
        self.events.lock().push(format!("worker_stopping:{status}"));
    }
}
