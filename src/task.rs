use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::TaskConfig;

/// The opaque long-running operation driven by the worker.
///
/// Implementations take no arguments and report nothing back; whatever they
/// need to record (files, logs, external side effects) is their own business.
pub trait LongTask: Send + Sync + 'static {
    fn run(&self);
}

impl<F> LongTask for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn run(&self) {
        self()
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task command is empty")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// Runs an external program to completion on every invocation.
#[derive(Debug, Clone)]
pub struct CommandTask {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandTask {
    pub fn new(command: &[String], working_dir: Option<PathBuf>) -> Result<Self, TaskError> {
        let (program, args) = command.split_first().ok_or(TaskError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir,
        })
    }

    pub fn from_config(cfg: &TaskConfig) -> Result<Self, TaskError> {
        Self::new(&cfg.command, cfg.working_dir.clone())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs the command once and waits for it to exit.
    pub fn execute(&self) -> Result<ExitStatus, TaskError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let status = command.status().map_err(|source| TaskError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(status)
        } else {
            Err(TaskError::Failed {
                program: self.program.clone(),
                status,
            })
        }
    }
}

impl LongTask for CommandTask {
    fn run(&self) {
        let started = Instant::now();
        match self.execute() {
            Ok(_) => info!(
                program = %self.program,
                elapsed = ?started.elapsed(),
                "task command finished"
            ),
            Err(err @ TaskError::Failed { .. }) => {
                warn!(error = %err, elapsed = ?started.elapsed(), "task command failed")
            }
            Err(err) => error!(error = %err, "task command could not run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn closures_are_tasks() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        LongTask::run(&task);
        LongTask::run(&task);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandTask::new(&[], None),
            Err(TaskError::EmptyCommand)
        ));
    }

    #[test]
    fn splits_program_and_args() {
        let task = CommandTask::new(&cmd(&["sleep", "10"]), None).expect("task");
        assert_eq!(task.program(), "sleep");
        assert_eq!(task.args, vec!["10".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn successful_command_reports_status() {
        let task = CommandTask::new(&cmd(&["true"]), None).expect("task");
        let status = task.execute().expect("true should succeed");
        assert!(status.success());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_an_error() {
        let task = CommandTask::new(&cmd(&["false"]), None).expect("task");
        assert!(matches!(task.execute(), Err(TaskError::Failed { .. })));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let task =
            CommandTask::new(&cmd(&["/nonexistent/flow-runner-task"]), None).expect("task");
        assert!(matches!(task.execute(), Err(TaskError::Spawn { .. })));
        // Errors stay inside the task.
        task.run();
    }

    #[cfg(unix)]
    #[test]
    fn runs_in_configured_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = CommandTask::new(
            &cmd(&["sh", "-c", "touch ran-here"]),
            Some(dir.path().to_path_buf()),
        )
        .expect("task");
        task.execute().expect("command succeeds");
        assert!(dir.path().join("ran-here").exists());
    }
}
