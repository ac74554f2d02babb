//! Queue and worker metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! host installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "docket_jobs_enqueued_total";
    /// Total reservations taken.
    pub const JOBS_RESERVED_TOTAL: &str = "docket_jobs_reserved_total";
    /// Total jobs whose handler returned normally.
    pub const JOBS_PROCESSED_TOTAL: &str = "docket_jobs_processed_total";
    /// Total jobs released for retry.
    pub const JOBS_RELEASED_TOTAL: &str = "docket_jobs_released_total";
    /// Total jobs moved to the failure log.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "docket_jobs_dead_lettered_total";
    /// Total handler timeouts.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "docket_jobs_timed_out_total";
    /// Total claims turned away by admission control.
    pub const ADMISSION_DENIED_TOTAL: &str = "docket_jobs_admission_denied_total";
    /// Total child processes launched.
    pub const PROCESSES_LAUNCHED_TOTAL: &str = "docket_jobs_processes_launched_total";
    /// Total errors caught at the worker loop boundary.
    pub const WORKER_ERRORS_TOTAL: &str = "docket_worker_errors_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "docket_job_duration_seconds";

    /// Whether the worker loop is running.
    pub const WORKER_RUNNING: &str = "docket_worker_running";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_RESERVED_TOTAL, "Total number of job reservations");
    describe_counter!(
        names::JOBS_PROCESSED_TOTAL,
        "Total number of jobs whose handler returned normally"
    );
    describe_counter!(names::JOBS_RELEASED_TOTAL, "Total number of jobs released for retry");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the failure log"
    );
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of handler timeouts");
    describe_counter!(
        names::ADMISSION_DENIED_TOTAL,
        "Total number of claims turned away by admission control"
    );
    describe_counter!(
        names::PROCESSES_LAUNCHED_TOTAL,
        "Total number of job processes launched"
    );
    describe_counter!(
        names::WORKER_ERRORS_TOTAL,
        "Total number of errors caught by the worker loop"
    );

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_gauge!(names::WORKER_RUNNING, "Whether the worker loop is running (1) or not (0)");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(connection: &str, queue: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a reservation.
    pub fn job_reserved(connection: &str, queue: &str) {
        counter!(
            names::JOBS_RESERVED_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a handler that returned normally.
    pub fn job_processed(connection: &str, queue: &str, duration: Duration) {
        counter!(
            names::JOBS_PROCESSED_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "connection" => connection.to_string(),
            "queue" => queue.to_string(),
            "status" => "processed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a handler that raised.
    pub fn job_errored(connection: &str, queue: &str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "connection" => connection.to_string(),
            "queue" => queue.to_string(),
            "status" => "errored"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job released for retry.
    pub fn job_released(connection: &str, queue: &str) {
        counter!(
            names::JOBS_RELEASED_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a job moved to the failure log.
    pub fn job_dead_lettered(connection: &str, queue: &str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a handler timeout.
    pub fn job_timed_out(connection: &str, queue: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }
}

/// Worker loop metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a claim denied by admission control.
    pub fn admission_denied(connection: &str, queue: &str) {
        counter!(
            names::ADMISSION_DENIED_TOTAL,
            "connection" => connection.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    /// Record a child process launch.
    pub fn process_launched(connection: &str) {
        counter!(
            names::PROCESSES_LAUNCHED_TOTAL,
            "connection" => connection.to_string()
        )
        .increment(1);
    }

    /// Record an error caught by the loop.
    pub fn worker_error(connection: &str) {
        counter!(
            names::WORKER_ERRORS_TOTAL,
            "connection" => connection.to_string()
        )
        .increment(1);
    }

    /// Update the running gauge.
    pub fn set_running(connection: &str, running: bool) {
        gauge!(
            names::WORKER_RUNNING,
            "connection" => connection.to_string()
        )
        .set(if running { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        register_metrics();
    }

    #[test]
    fn test_recorders_without_exporter() {
        JobMetrics::job_enqueued("default", "mail");
        JobMetrics::job_processed("default", "mail", Duration::from_millis(5));
        JobMetrics::job_errored("default", "mail", Duration::from_millis(5));
        WorkerMetrics::admission_denied("default", "mail");
        WorkerMetrics::set_running("default", true);
    }
}
