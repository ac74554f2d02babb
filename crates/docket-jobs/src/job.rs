//! Job records, payloads, and handles.

use crate::error::{JobError, JobResult};
use crate::queue::DocumentQueue;
use chrono::{DateTime, TimeZone, Utc};
use docket_core::DocumentId;
use docket_store::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Field names of a stored job record.
pub mod fields {
    pub const QUEUE: &str = "queue";
    pub const PAYLOAD: &str = "payload";
    pub const ATTEMPTS: &str = "attempts";
    pub const RESERVED: &str = "reserved";
    pub const RESERVED_AT: &str = "reserved_at";
    pub const AVAILABLE_AT: &str = "available_at";
    pub const CREATED_AT: &str = "created_at";
    pub const CLAIM_TOKEN: &str = "claim_token";
    pub const CLAIMED_AT: &str = "claimed_at";
}

/// What a producer enqueues: the handler name plus its arguments.
///
/// Stored as `{"job": ..., "data": ..., "maxTries": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Registered handler name.
    pub job: String,

    /// Handler arguments.
    #[serde(default)]
    pub data: Value,

    /// Per-job attempt ceiling, overriding the worker's.
    #[serde(rename = "maxTries", default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
}

impl Payload {
    /// Creates a payload for `job` with the given arguments.
    pub fn new(job: impl Into<String>, data: Value) -> Self {
        Self {
            job: job.into(),
            data,
            max_tries: None,
        }
    }

    /// Sets a per-job attempt ceiling.
    #[must_use]
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Serializes the payload to its stored form.
    pub fn to_raw(&self) -> JobResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a stored payload.
    pub fn from_raw(raw: &str) -> JobResult<Self> {
        serde_json::from_str(raw).map_err(|e| JobError::InvalidPayload(e.to_string()))
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Primary key.
    #[serde(rename = "_id")]
    pub id: DocumentId,

    /// Queue within the connection.
    pub queue: String,

    /// Serialized payload.
    pub payload: String,

    /// Reservation cycles so far.
    #[serde(default)]
    pub attempts: u32,

    /// Claimed by some worker.
    #[serde(default)]
    pub reserved: bool,

    /// Start of the current reservation, Unix seconds.
    #[serde(default)]
    pub reserved_at: Option<i64>,

    /// Earliest claim time, Unix seconds.
    pub available_at: i64,

    /// Creation time, Unix seconds.
    pub created_at: i64,

    /// Marker set by the poll that picked this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,

    /// When the claim marker was set, Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
}

impl JobRecord {
    /// Decodes a stored document.
    pub fn from_document(doc: Document) -> JobResult<Self> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }
}

fn to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// In-memory view of one job record.
///
/// `delete`, `release` and `mark_failed` are terminal: once one of them has
/// taken effect, later calls on the same handle do nothing.
pub struct JobHandle {
    record: JobRecord,
    connection: String,
    queue_store: Arc<DocumentQueue>,
    owns_reservation: bool,
    deleted: bool,
    released: bool,
    failed: bool,
    failure_reason: Option<String>,
}

impl JobHandle {
    pub(crate) fn new(record: JobRecord, queue_store: Arc<DocumentQueue>) -> Self {
        Self {
            connection: queue_store.connection_name().to_string(),
            record,
            queue_store,
            owns_reservation: false,
            deleted: false,
            released: false,
            failed: false,
            failure_reason: None,
        }
    }

    /// Record id.
    #[must_use]
    pub fn id(&self) -> DocumentId {
        self.record.id
    }

    /// Queue the job was pulled from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.record.queue
    }

    /// Connection the job belongs to.
    #[must_use]
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Reservation cycles so far, including the current one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.record.attempts
    }

    /// Whether the record is reserved.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.record.reserved
    }

    /// Start of the current reservation.
    #[must_use]
    pub fn reserved_at(&self) -> Option<DateTime<Utc>> {
        self.record.reserved_at.and_then(to_datetime)
    }

    /// When the job became available.
    #[must_use]
    pub fn available_at(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.record.available_at)
    }

    /// The payload exactly as stored.
    #[must_use]
    pub fn raw_payload(&self) -> &str {
        &self.record.payload
    }

    /// Decodes the payload.
    pub fn payload(&self) -> JobResult<Payload> {
        Payload::from_raw(&self.record.payload)
    }

    /// Handler name from the payload, if it decodes.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.payload().ok().map(|p| p.job)
    }

    /// The underlying record.
    #[must_use]
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Whether the job was deleted through this handle.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the job was released through this handle.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Whether the job was marked failed through this handle.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Whether a terminal transition already took effect.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.deleted || self.released || self.failed
    }

    /// Reason passed to [`JobHandle::mark_failed`].
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Removes the job from the queue.
    pub async fn delete(&mut self) -> JobResult<()> {
        if self.is_terminal() {
            debug!(job_id = %self.id(), "Ignoring delete on finished job");
            return Ok(());
        }
        self.queue_store
            .delete_reserved(&self.record.queue, self.record.id)
            .await?;
        self.deleted = true;
        Ok(())
    }

    /// Puts the job back on its queue after `delay` seconds.
    pub async fn release(&mut self, delay: u64) -> JobResult<()> {
        if self.is_terminal() {
            debug!(job_id = %self.id(), "Ignoring release on finished job");
            return Ok(());
        }
        self.queue_store.release(&self.record, delay).await?;
        self.released = true;
        Ok(())
    }

    /// Marks the job failed and removes it from the queue.
    ///
    /// A worker processing the job appends `reason` to the failure log.
    pub async fn mark_failed(&mut self, reason: impl Into<String>) -> JobResult<()> {
        if self.is_terminal() {
            debug!(job_id = %self.id(), "Ignoring mark_failed on finished job");
            return Ok(());
        }
        self.queue_store
            .delete_reserved(&self.record.queue, self.record.id)
            .await?;
        self.failed = true;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub(crate) fn owns_reservation(&self) -> bool {
        self.owns_reservation
    }

    pub(crate) fn claim_token(&self) -> Option<&str> {
        self.record.claim_token.as_deref()
    }

    pub(crate) fn mark_reserved_locally(&mut self, now: i64) {
        self.record.reserved = true;
        self.record.reserved_at = Some(now);
        self.record.attempts += 1;
        self.record.claim_token = None;
        self.record.claimed_at = None;
        self.owns_reservation = true;
    }

    pub(crate) fn clear_claim_locally(&mut self) {
        self.record.claim_token = None;
        self.record.claimed_at = None;
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.record.id)
            .field("connection", &self.connection)
            .field("queue", &self.record.queue)
            .field("attempts", &self.record.attempts)
            .field("reserved", &self.record.reserved)
            .field("deleted", &self.deleted)
            .field("released", &self.released)
            .field("failed", &self.failed)
            .finish()
    }
}
