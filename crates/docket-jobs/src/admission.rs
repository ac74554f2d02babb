//! Admission control: how many jobs may be reserved at once.
//!
//! The default policy is an advisory gauge. It counts reserved records and
//! compares against the connection limit, so independent workers that
//! interleave their count and claim steps can overshoot the limit slightly.
//! Deployments that need a hard cap can plug in their own policy.

use crate::error::JobResult;
use crate::job::JobHandle;
use crate::queue::DocumentQueue;
use async_trait::async_trait;
use docket_config::{AdmissionMode, ConnectionConfig};
use std::sync::Arc;

/// Decides whether a claimed job may be reserved and run.
#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    /// Returns true if the job may proceed.
    async fn admit(&self, queue: &DocumentQueue, job: &JobHandle) -> JobResult<bool>;
}

/// What the reserved-job count covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    /// Only the job's own queue.
    Queue,
    /// Every queue on the connection.
    Connection,
}

/// Admits a job while fewer than `limit` jobs are reserved.
///
/// A job that is itself already reserved is always admitted, so a worker
/// re-checking its own claim never blocks on itself.
#[derive(Debug, Clone, Copy)]
pub struct CountingAdmission {
    limit: u64,
    scope: CountScope,
}

impl CountingAdmission {
    /// Creates a counting policy.
    #[must_use]
    pub const fn new(limit: u64, scope: CountScope) -> Self {
        Self { limit, scope }
    }
}

#[async_trait]
impl AdmissionPolicy for CountingAdmission {
    async fn admit(&self, queue: &DocumentQueue, job: &JobHandle) -> JobResult<bool> {
        if job.is_reserved() {
            return Ok(true);
        }

        let scope = match self.scope {
            CountScope::Queue => Some(job.queue()),
            CountScope::Connection => None,
        };
        let reserved = queue.reserved_count(scope).await?;
        Ok(reserved < self.limit)
    }
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedAdmission;

#[async_trait]
impl AdmissionPolicy for UnlimitedAdmission {
    async fn admit(&self, _queue: &DocumentQueue, _job: &JobHandle) -> JobResult<bool> {
        Ok(true)
    }
}

/// Builds the policy a connection is configured with.
#[must_use]
pub fn policy_for(config: &ConnectionConfig) -> Arc<dyn AdmissionPolicy> {
    match config.admission {
        AdmissionMode::Queue => Arc::new(CountingAdmission::new(config.limit, CountScope::Queue)),
        AdmissionMode::Connection => {
            Arc::new(CountingAdmission::new(config.limit, CountScope::Connection))
        }
        AdmissionMode::Unlimited => Arc::new(UnlimitedAdmission),
    }
}
