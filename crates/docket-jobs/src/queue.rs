//! Queue storage and the reservation protocol.
//!
//! A [`DocumentQueue`] owns every mutation of the job records in one
//! connection's collection. Claiming is a single atomic find-and-update that
//! stamps a claim token on the oldest claimable record; reservation is then
//! conditioned on that token, so two pollers can never reserve the same
//! record from the same claim.

use crate::admission::{self, AdmissionPolicy};
use crate::error::JobResult;
use crate::job::{fields, JobHandle, JobRecord, Payload};
use crate::metrics::JobMetrics;
use docket_config::{ConnectionConfig, DispatchMode};
use docket_core::{Clock, DocumentId};
use docket_store::{Document, DocumentStore, Filter, Sort, Update};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Job records of one connection, stored in one collection.
pub struct DocumentQueue {
    connection: String,
    config: ConnectionConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    admission: Arc<dyn AdmissionPolicy>,
}

impl std::fmt::Debug for DocumentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentQueue")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl DocumentQueue {
    /// Creates the queue store for a connection.
    pub fn new(
        connection: impl Into<String>,
        config: ConnectionConfig,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let admission = admission::policy_for(&config);
        Self {
            connection: connection.into(),
            config,
            store,
            clock,
            admission,
        }
    }

    /// Replaces the admission policy.
    #[must_use]
    pub fn with_admission(mut self, policy: Arc<dyn AdmissionPolicy>) -> Self {
        self.admission = policy;
        self
    }

    /// Connection name.
    #[must_use]
    pub fn connection_name(&self) -> &str {
        &self.connection
    }

    /// Connection settings.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// How claimed jobs of this connection are executed.
    #[must_use]
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.config.dispatch
    }

    /// Resolves an optional queue name against the connection default.
    #[must_use]
    pub fn queue_name<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        match queue {
            Some(name) if !name.trim().is_empty() => name.trim(),
            _ => &self.config.queue,
        }
    }

    /// Pushes a job that is available immediately.
    pub async fn push(&self, payload: &Payload, queue: Option<&str>) -> JobResult<DocumentId> {
        self.push_raw(&payload.to_raw()?, queue).await
    }

    /// Pushes an already serialized payload.
    pub async fn push_raw(&self, payload: &str, queue: Option<&str>) -> JobResult<DocumentId> {
        self.push_to_store(0, queue, payload).await
    }

    /// Pushes a job that becomes available after `delay` seconds.
    pub async fn later(
        &self,
        delay: u64,
        payload: &Payload,
        queue: Option<&str>,
    ) -> JobResult<DocumentId> {
        self.push_to_store(delay, queue, &payload.to_raw()?).await
    }

    /// Pushes several jobs in one batch, all with the same availability time.
    pub async fn bulk(&self, payloads: &[Payload], queue: Option<&str>) -> JobResult<Vec<DocumentId>> {
        let queue = self.queue_name(queue);
        let now = self.clock.unix_now();

        let mut docs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            docs.push(Self::new_record(queue, &payload.to_raw()?, now, now));
        }

        let ids = self.store.insert_many(&self.config.table, docs).await?;
        for _ in &ids {
            JobMetrics::job_enqueued(&self.connection, queue);
        }
        debug!(connection = %self.connection, queue = %queue, count = ids.len(), "Bulk enqueued jobs");
        Ok(ids)
    }

    /// Whether a job with this exact payload is present on the queue.
    pub async fn exists(&self, payload: &Payload, queue: Option<&str>) -> JobResult<bool> {
        self.exists_raw(&payload.to_raw()?, queue).await
    }

    /// Whether a job with this exact serialized payload is present on the queue.
    pub async fn exists_raw(&self, payload: &str, queue: Option<&str>) -> JobResult<bool> {
        let filter = Filter::And(vec![
            Filter::eq(fields::QUEUE, self.queue_name(queue)),
            Filter::eq(fields::PAYLOAD, payload),
        ]);
        Ok(self.store.count(&self.config.table, &filter).await? > 0)
    }

    /// Number of records on a queue, in any state.
    pub async fn size(&self, queue: Option<&str>) -> JobResult<u64> {
        let filter = Filter::eq(fields::QUEUE, self.queue_name(queue));
        Ok(self.store.count(&self.config.table, &filter).await?)
    }

    /// Number of reserved records, on one queue or across the connection.
    pub async fn reserved_count(&self, queue: Option<&str>) -> JobResult<u64> {
        let reserved = Filter::eq(fields::RESERVED, true);
        let filter = match queue {
            Some(queue) => Filter::And(vec![reserved, Filter::eq(fields::QUEUE, queue)]),
            None => reserved,
        };
        Ok(self.store.count(&self.config.table, &filter).await?)
    }

    /// Claims the oldest claimable job from the first queue in the
    /// comma-separated list that has one.
    pub async fn pop(self: &Arc<Self>, queues: &str) -> JobResult<Option<JobHandle>> {
        let mut names: Vec<&str> = queues
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            names.push(&self.config.queue);
        }

        for queue in names {
            let now = self.clock.unix_now();
            let token = Uuid::new_v4().to_string();
            let claim = Update::new()
                .set(fields::CLAIM_TOKEN, token)
                .set(fields::CLAIMED_AT, now);

            let claimed = self
                .store
                .find_one_and_update(
                    &self.config.table,
                    &self.claimable_filter(queue, now),
                    &Sort::default(),
                    &claim,
                )
                .await?;

            if let Some(doc) = claimed {
                let record = JobRecord::from_document(doc)?;
                debug!(
                    connection = %self.connection,
                    queue = %queue,
                    job_id = %record.id,
                    attempts = record.attempts,
                    "Claimed job"
                );
                return Ok(Some(JobHandle::new(record, Arc::clone(self))));
            }
        }

        Ok(None)
    }

    /// Reserves a claimed job: `reserved = true`, `reserved_at = now`,
    /// `attempts += 1`.
    ///
    /// Returns false if the claim was lost to another poller, in which case
    /// the job must be abandoned. Reserving a job this handle already
    /// reserved is a no-op.
    pub async fn mark_reserved(&self, job: &mut JobHandle) -> JobResult<bool> {
        if job.owns_reservation() {
            return Ok(true);
        }

        let now = self.clock.unix_now();
        let mut conditions = vec![Filter::by_id(job.id())];
        if let Some(token) = job.claim_token() {
            conditions.push(Filter::eq(fields::CLAIM_TOKEN, token));
        }

        let update = Update::new()
            .set(fields::RESERVED, true)
            .set(fields::RESERVED_AT, now)
            .set(fields::CLAIM_TOKEN, Value::Null)
            .set(fields::CLAIMED_AT, Value::Null)
            .inc(fields::ATTEMPTS, 1);

        let matched = self
            .store
            .update_one(&self.config.table, &Filter::And(conditions), &update)
            .await?;

        if matched {
            job.mark_reserved_locally(now);
            JobMetrics::job_reserved(&self.connection, job.queue());
            debug!(job_id = %job.id(), attempts = job.attempts(), "Reserved job");
        } else {
            warn!(job_id = %job.id(), "Claim lost before reservation, abandoning job");
        }

        Ok(matched)
    }

    /// Drops the claim marker so the job is immediately claimable again.
    pub async fn unclaim(&self, job: &mut JobHandle) -> JobResult<()> {
        let Some(token) = job.claim_token().map(str::to_string) else {
            return Ok(());
        };

        let filter = Filter::And(vec![
            Filter::by_id(job.id()),
            Filter::eq(fields::CLAIM_TOKEN, token),
        ]);
        let update = Update::new()
            .set(fields::CLAIM_TOKEN, Value::Null)
            .set(fields::CLAIMED_AT, Value::Null);

        self.store.update_one(&self.config.table, &filter, &update).await?;
        job.clear_claim_locally();
        Ok(())
    }

    /// Makes a reserved job available again after `delay` seconds,
    /// keeping its id and attempt count.
    ///
    /// Skipped if the reservation has since been reclaimed by someone else.
    pub async fn release(&self, record: &JobRecord, delay: u64) -> JobResult<()> {
        let available_at = self.clock.unix_now().saturating_add(delay_secs(delay));

        let filter = Filter::And(vec![
            Filter::by_id(record.id),
            Filter::eq(
                fields::RESERVED_AT,
                record.reserved_at.map_or(Value::Null, Value::from),
            ),
        ]);
        let update = Update::new()
            .set(fields::RESERVED, false)
            .set(fields::RESERVED_AT, Value::Null)
            .set(fields::AVAILABLE_AT, available_at)
            .set(fields::CLAIM_TOKEN, Value::Null)
            .set(fields::CLAIMED_AT, Value::Null);

        let matched = self
            .store
            .update_one(&self.config.table, &filter, &update)
            .await?;

        if matched {
            JobMetrics::job_released(&self.connection, &record.queue);
            debug!(job_id = %record.id, delay, attempts = record.attempts, "Released job");
        } else {
            warn!(job_id = %record.id, "Reservation no longer held, release skipped");
        }
        Ok(())
    }

    /// Permanently removes a job.
    pub async fn delete_reserved(&self, queue: &str, id: DocumentId) -> JobResult<()> {
        let filter = Filter::And(vec![Filter::by_id(id), Filter::eq(fields::QUEUE, queue)]);
        let removed = self.store.remove(&self.config.table, &filter).await?;
        if removed == 0 {
            debug!(job_id = %id, queue = %queue, "Job already gone on delete");
        }
        Ok(())
    }

    /// Whether the admission policy lets this job run now.
    pub async fn can_admit(&self, job: &JobHandle) -> JobResult<bool> {
        self.admission.admit(self, job).await
    }

    /// Loads a job by id, bypassing claiming and admission.
    pub async fn get_by_id(self: &Arc<Self>, id: DocumentId) -> JobResult<Option<JobHandle>> {
        let doc = self
            .store
            .find_one(&self.config.table, &Filter::by_id(id), &Sort::default())
            .await?;

        match doc {
            Some(doc) => Ok(Some(JobHandle::new(
                JobRecord::from_document(doc)?,
                Arc::clone(self),
            ))),
            None => Ok(None),
        }
    }

    /// Records with no live claim that are either available or whose
    /// reservation outlived the visibility timeout.
    fn claimable_filter(&self, queue: &str, now: i64) -> Filter {
        let expired = now.saturating_sub(delay_secs(self.config.expire));
        Filter::And(vec![
            Filter::eq(fields::QUEUE, queue),
            Filter::Or(vec![
                Filter::is_null(fields::CLAIM_TOKEN),
                Filter::lte(fields::CLAIMED_AT, expired),
            ]),
            Filter::Or(vec![
                Filter::And(vec![
                    Filter::eq(fields::RESERVED, false),
                    Filter::lte(fields::AVAILABLE_AT, now),
                ]),
                Filter::And(vec![
                    Filter::eq(fields::RESERVED, true),
                    Filter::lte(fields::RESERVED_AT, expired),
                ]),
            ]),
        ])
    }

    async fn push_to_store(
        &self,
        delay: u64,
        queue: Option<&str>,
        payload: &str,
    ) -> JobResult<DocumentId> {
        let queue = self.queue_name(queue);
        let now = self.clock.unix_now();
        let available_at = now.saturating_add(delay_secs(delay));

        let id = self
            .store
            .insert_one(
                &self.config.table,
                Self::new_record(queue, payload, available_at, now),
            )
            .await?;

        JobMetrics::job_enqueued(&self.connection, queue);
        debug!(connection = %self.connection, queue = %queue, job_id = %id, delay, "Enqueued job");
        Ok(id)
    }

    fn new_record(queue: &str, payload: &str, available_at: i64, now: i64) -> Document {
        let mut doc = Document::new();
        doc.insert(fields::QUEUE.to_string(), Value::from(queue));
        doc.insert(fields::PAYLOAD.to_string(), Value::from(payload));
        doc.insert(fields::ATTEMPTS.to_string(), Value::from(0));
        doc.insert(fields::RESERVED.to_string(), Value::Bool(false));
        doc.insert(fields::RESERVED_AT.to_string(), Value::Null);
        doc.insert(fields::AVAILABLE_AT.to_string(), Value::from(available_at));
        doc.insert(fields::CREATED_AT.to_string(), Value::from(now));
        doc
    }
}

fn delay_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}
