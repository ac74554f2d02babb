//! Process-per-job dispatch.
//!
//! The worker only reserves the job and launches a detached child that
//! re-enters through the `process-job` command. The child loads the job by
//! id and performs the success, retry, or failure transition itself.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use docket_config::ProcessConfig;
use docket_core::DocumentId;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Sub-command the child process runs.
pub const PROCESS_JOB_COMMAND: &str = "process-job";

/// Host shell family, which decides the backgrounding syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// `sh`: output to `/dev/null`, backgrounded with `&`.
    Posix,
    /// `cmd`: launched through `start /B`.
    Windows,
}

impl Platform {
    /// The platform this binary was built for.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }
}

/// Quotes one argument for the platform shell.
#[must_use]
pub fn escape_arg(arg: &str, platform: Platform) -> String {
    match platform {
        Platform::Posix => format!("'{}'", arg.replace('\'', r"'\''")),
        Platform::Windows => {
            let cleaned: String = arg
                .chars()
                .map(|c| if matches!(c, '"' | '%' | '!') { ' ' } else { c })
                .collect();
            format!("\"{cleaned}\"")
        }
    }
}

/// Binary used when the running executable cannot be resolved.
pub const DEFAULT_BINARY: &str = "docket-worker";

/// Fixed parts of the child command line.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    binary: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        let binary = std::env::current_exe()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|_| DEFAULT_BINARY.to_string());
        Self::new(binary)
    }
}

impl CommandTemplate {
    /// Creates a template for `binary`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Builds the template from configuration, defaulting to the running executable.
    pub fn from_config(config: &ProcessConfig) -> JobResult<Self> {
        let binary = match &config.binary {
            Some(binary) => binary.clone(),
            None => std::env::current_exe()
                .map_err(|e| JobError::Spawn(format!("Cannot resolve current executable: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(Self {
            binary,
            args: config.args.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
        })
    }

    /// The binary the child runs.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Adds arguments placed before the sub-command.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command that processes one job.
    #[must_use]
    pub fn for_job(&self, id: DocumentId, connection: &str, queue: &str) -> ProcessCommand {
        let mut args = self.args.clone();
        args.push(PROCESS_JOB_COMMAND.to_string());
        args.push(format!("--id={id}"));
        args.push(format!("--connection={connection}"));
        args.push(format!("--queue={queue}"));

        ProcessCommand {
            binary: self.binary.clone(),
            args,
            working_dir: self.working_dir.clone(),
        }
    }
}

/// A fully resolved child command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessCommand {
    /// Renders the detached shell command line.
    #[must_use]
    pub fn render(&self, platform: Platform) -> String {
        let command = std::iter::once(self.binary.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| escape_arg(part, platform))
            .collect::<Vec<_>>()
            .join(" ");

        match platform {
            Platform::Posix => format!("{command} > /dev/null 2>&1 &"),
            Platform::Windows => format!("start /B \"\" {command} > NUL"),
        }
    }
}

/// Starts a child process without waiting for it to finish.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launches `command` detached.
    async fn launch(&self, command: &ProcessCommand) -> JobResult<()>;
}

/// Launches through the platform shell with output discarded.
#[derive(Debug, Clone, Copy)]
pub struct ShellLauncher {
    platform: Platform,
}

impl ShellLauncher {
    /// Creates a launcher for an explicit platform.
    #[must_use]
    pub const fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self::new(Platform::current())
    }
}

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn launch(&self, command: &ProcessCommand) -> JobResult<()> {
        let line = command.render(self.platform);

        let mut shell = match self.platform {
            Platform::Posix => {
                let mut shell = Command::new("sh");
                shell.arg("-c").arg(&line);
                shell
            }
            Platform::Windows => {
                let mut shell = Command::new("cmd");
                shell.arg("/C").arg(&line);
                shell
            }
        };

        if let Some(dir) = &command.working_dir {
            shell.current_dir(dir);
        }
        shell
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // The shell returns as soon as the child is backgrounded.
        let status = shell
            .status()
            .await
            .map_err(|e| JobError::Spawn(e.to_string()))?;

        if !status.success() {
            return Err(JobError::Spawn(format!("Launcher shell exited with {status}")));
        }

        debug!(command = %line, "Launched job process");
        Ok(())
    }
}
