//! Application wiring and command execution.

use crate::cli::{Command, FailedAction, OptionOverrides, ProcessJobArgs, PushArgs, WorkArgs};
use crate::handlers;
use crate::startup;
use anyhow::{anyhow, Context};
use docket_config::AppConfig;
use docket_core::{Clock, DocumentId, SystemClock};
use docket_jobs::{
    register_metrics, CommandTemplate, DocumentFailedJobProvider, FailedJobProvider,
    HandlerRegistry, Payload, QueueManager, TracingListener, Worker, WorkerOptions,
};
use docket_store::DocumentStore;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

/// Exit status of a `process-job` run whose job did not complete.
pub const JOB_FAILED_STATUS: i32 = 1;

/// Everything a command needs, built once from configuration.
pub struct App {
    config: AppConfig,
    config_dir: Option<String>,
    manager: Arc<QueueManager>,
    handlers: Arc<HandlerRegistry>,
    failer: Arc<dyn FailedJobProvider>,
}

impl App {
    /// Connects to the configured store and wires the queue.
    pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Self> {
        let store = docket_store::connect(&config.store)
            .await
            .context("Failed to connect to the document store")?;
        Ok(Self::with_store(config, store))
    }

    /// Wires the queue over an existing store.
    pub fn with_store(config: AppConfig, store: Arc<dyn DocumentStore>) -> Self {
        register_metrics();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let manager = Arc::new(QueueManager::new(&config, Arc::clone(&store), Arc::clone(&clock)));
        let failer = Arc::new(DocumentFailedJobProvider::new(
            store,
            clock,
            config.failed.table.clone(),
        ));

        let handlers = Arc::new(HandlerRegistry::new());
        handlers::register_builtin(&handlers);

        Self {
            config,
            config_dir: None,
            manager,
            handlers,
            failer,
        }
    }

    /// Config directory handed to child processes.
    #[must_use]
    pub fn with_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Connection registry.
    #[must_use]
    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Handler registry; register application handlers here before running.
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Failure log.
    #[must_use]
    pub fn failer(&self) -> &Arc<dyn FailedJobProvider> {
        &self.failer
    }

    /// Builds a worker with tracing listeners and the configured child command.
    pub fn worker(&self) -> anyhow::Result<Worker> {
        let mut command = CommandTemplate::from_config(&self.config.process)?;
        if let Some(dir) = &self.config_dir {
            command = command.with_args(["--config", dir.as_str()]);
        }

        Ok(Worker::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.handlers),
            Arc::clone(&self.failer),
        )
        .with_listener(Arc::new(TracingListener))
        .with_command(command))
    }

    /// Worker options from configuration with command line overrides.
    #[must_use]
    pub fn worker_options(&self, overrides: &OptionOverrides) -> WorkerOptions {
        overrides.apply(WorkerOptions::from(&self.config.worker))
    }

    /// Runs one command. Returns the process exit status.
    pub async fn run(&self, command: &Command, out: &mut impl Write) -> anyhow::Result<i32> {
        match command {
            Command::Work(args) => self.work(args).await,
            Command::ProcessJob(args) => self.process_job(args).await,
            Command::Push(args) => self.push(args, out).await.map(|()| 0),
            Command::Failed { action } => self.failed(action, out).await.map(|()| 0),
        }
    }

    async fn work(&self, args: &WorkArgs) -> anyhow::Result<i32> {
        let worker = self.worker()?;
        let options = self.worker_options(&args.options);
        let connection = args
            .connection
            .clone()
            .unwrap_or_else(|| self.config.default_connection.clone());
        let queue = match &args.queue {
            Some(queue) => queue.clone(),
            None => self.config.connection(&connection)?.queue.clone(),
        };

        let signals = startup::watch_signals(worker.stop_handle());
        let exit = worker.daemon(&connection, &queue, &options).await;
        signals.abort();

        let exit = exit?;
        Ok(exit.status)
    }

    /// Job errors were already passed to the worker's reporter, so they
    /// only turn into [`JOB_FAILED_STATUS`] here.
    async fn process_job(&self, args: &ProcessJobArgs) -> anyhow::Result<i32> {
        let id = parse_id(&args.id)?;
        let connection = args
            .connection
            .as_deref()
            .unwrap_or(&self.config.default_connection);
        let options = self.worker_options(&args.options);

        info!(job_id = %id, connection = %connection, queue = ?args.queue, "Processing job by id");
        let result = self
            .worker()?
            .run_job_by_id(connection, id, args.queue.as_deref(), &options)
            .await;
        Ok(if result.is_ok() { 0 } else { JOB_FAILED_STATUS })
    }

    async fn push(&self, args: &PushArgs, out: &mut impl Write) -> anyhow::Result<()> {
        let data = serde_json::from_str(&args.data).context("--data must be valid JSON")?;
        let mut payload = Payload::new(args.job.clone(), data);
        if let Some(max_tries) = args.max_tries {
            payload = payload.with_max_tries(max_tries);
        }

        let queue = args.queue.as_deref();
        let connection = args.connection.as_deref();
        let id = match (args.unique, args.delay) {
            (false, 0) => Some(self.manager.push(&payload, queue, connection).await?),
            (false, delay) => Some(self.manager.later(delay, &payload, queue, connection).await?),
            (true, 0) => self.manager.push_unique(&payload, queue, connection).await?,
            (true, delay) => {
                self.manager
                    .later_unique(delay, &payload, queue, connection)
                    .await?
            }
        };

        match id {
            Some(id) => writeln!(out, "{id}")?,
            None => writeln!(out, "skipped: identical job already queued")?,
        }
        Ok(())
    }

    async fn failed(&self, action: &FailedAction, out: &mut impl Write) -> anyhow::Result<()> {
        match action {
            FailedAction::List => {
                for job in self.failer.all().await? {
                    let reason = job.exception.lines().next().unwrap_or_default();
                    writeln!(
                        out,
                        "{}\t{}\t{}\t{}\t{}",
                        job.id,
                        job.connection,
                        job.queue,
                        job.failed_at.to_rfc3339(),
                        reason
                    )?;
                }
            }
            FailedAction::Show { id } => {
                let id = parse_id(id)?;
                let job = self
                    .failer
                    .find(id)
                    .await?
                    .ok_or_else(|| anyhow!("No failed job with id {id}"))?;
                writeln!(out, "{}", serde_json::to_string_pretty(&job)?)?;
            }
            FailedAction::Forget { id } => {
                let id = parse_id(id)?;
                if self.failer.forget(id).await? {
                    writeln!(out, "forgot {id}")?;
                } else {
                    return Err(anyhow!("No failed job with id {id}"));
                }
            }
            FailedAction::Flush => {
                let removed = self.failer.flush().await?;
                writeln!(out, "flushed {removed}")?;
            }
        }
        Ok(())
    }
}

fn parse_id(raw: &str) -> anyhow::Result<DocumentId> {
    DocumentId::parse(raw).with_context(|| format!("Invalid job id: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docket_store::MemoryDocumentStore;

    fn app() -> App {
        App::with_store(AppConfig::default(), Arc::new(MemoryDocumentStore::new()))
    }

    #[test]
    fn test_builtin_handlers_registered() {
        assert_eq!(app().handlers().names(), vec!["fail", "log"]);
    }

    #[test]
    fn test_worker_options_from_config() {
        let app = app();
        let options = app.worker_options(&OptionOverrides::default());
        assert_eq!(options, WorkerOptions::from(&app.config().worker));
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("nope").is_err());
    }
}
