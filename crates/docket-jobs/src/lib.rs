//! Docket Jobs - Durable Document-Store Job Queue
//!
//! Jobs are records in a document store collection. Workers poll that
//! collection, reserve one job at a time, and either run it inline or hand
//! it to a detached child process. A reservation that outlives the
//! visibility timeout becomes claimable again, so a crashed worker never
//! loses a job.
//!
//! # Lifecycle
//!
//! ```text
//!   push / later / bulk
//!          │
//!          ▼
//!   ┌─────────────┐  pop + reserve  ┌──────────┐  handler ok   ┌─────────┐
//!   │  available  │ ──────────────▶ │ reserved │ ────────────▶ │ deleted │
//!   └─────────────┘                 └──────────┘               └─────────┘
//!          ▲                          │      │
//!          │  release(delay)          │      │ attempts >= max_tries
//!          └──────────────────────────┘      ▼
//!                                      ┌─────────────┐
//!                                      │ failure log │
//!                                      └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use docket_jobs::prelude::*;
//!
//! struct SendMail;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendMail {
//!     async fn handle(&self, job: &mut JobHandle, data: Value) -> JobResult<()> {
//!         mailer::send(&data).await.map_err(JobError::handler)?;
//!         job.delete().await
//!     }
//! }
//!
//! let manager = Arc::new(QueueManager::new(&config, store.clone(), clock.clone()));
//! manager.push(&Payload::new("send_mail", json!({"to": "a@b.c"})), None, None).await?;
//!
//! let handlers = Arc::new(HandlerRegistry::new());
//! handlers.register("send_mail", Arc::new(SendMail));
//!
//! let worker = Worker::new(manager, handlers, failer);
//! let exit = worker.daemon("default", "default", &WorkerOptions::default()).await?;
//! ```

pub mod admission;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod failed;
pub mod handler;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod probe;
pub mod queue;
pub mod reporter;
pub mod worker;

pub use admission::{AdmissionPolicy, CountScope, CountingAdmission, UnlimitedAdmission};
pub use dispatch::{CommandTemplate, Platform, ProcessCommand, ProcessLauncher, ShellLauncher};
pub use error::{JobError, JobResult};
pub use events::{TracingListener, WorkerEvents, WorkerListener};
pub use failed::{DocumentFailedJobProvider, FailedJob, FailedJobProvider};
pub use handler::{HandlerRegistry, JobHandler};
pub use job::{JobHandle, JobRecord, Payload};
pub use manager::QueueManager;
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use options::WorkerOptions;
pub use probe::{MemoryProbe, ProcMemoryProbe};
pub use queue::DocumentQueue;
pub use reporter::{ErrorReporter, TracingReporter};
pub use worker::{DaemonExit, StopHandle, Worker};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::handler::{HandlerRegistry, JobHandler};
    pub use crate::job::{JobHandle, Payload};
    pub use crate::manager::QueueManager;
    pub use crate::options::WorkerOptions;
    pub use crate::worker::Worker;
    pub use crate::{JobError, JobResult};
    pub use serde_json::Value;
}
