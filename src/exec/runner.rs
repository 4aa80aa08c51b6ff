//! # External Command Invocation
//!
//! The numerical calibration routines are opaque external programs with
//! declared input and output files. [`runcmd`] wraps every invocation with
//! the pipeline's idempotence contract: if every declared output already
//! exists the command is not run at all, and a command that exits cleanly
//! without producing its outputs is still a failure.

use crate::error::{Result, SpecpipeError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::process::Command;

/// One external program invocation with its declared file contract.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Files that must exist before the command may run.
    pub inputs: Vec<PathBuf>,
    /// Files the command is contracted to produce.
    pub outputs: Vec<PathBuf>,
}

impl StageCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, path: PathBuf) -> Self {
        self.inputs.push(path);
        self
    }

    pub fn output(mut self, path: PathBuf) -> Self {
        self.outputs.push(path);
        self
    }

    /// Rendered command line, for logs and batch scripts.
    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Outcome of a [`runcmd`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All declared outputs already existed; nothing was run.
    Skipped,
    /// The command was invoked and its outputs verified.
    Ran,
}

/// Strategy for actually executing a stage command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &StageCommand) -> Result<()>;
}

/// Spawns the external program as a child process.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &StageCommand) -> Result<()> {
        tracing::info!(cmd = %command.render(), "RUNNING");
        let status = Command::new(&command.program)
            .args(&command.args)
            .status()
            .await
            .map_err(|e| {
                SpecpipeError::PipelineError(format!(
                    "Failed to launch {}: {e}",
                    command.program
                ))
            })?;
        if !status.success() {
            return Err(SpecpipeError::PipelineError(format!(
                "{} exited with {status}",
                command.program
            )));
        }
        Ok(())
    }
}

/// Logs the command without executing it; used by dry-run levels that
/// simulate submission. Declared outputs are not created, so every stage
/// keeps reporting work to do.
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, command: &StageCommand) -> Result<()> {
        tracing::info!(cmd = %command.render(), "DRY RUN, not executing");
        Ok(())
    }
}

/// Test double that records every invocation and touches the declared
/// outputs so downstream stages see them.
#[derive(Default)]
pub struct RecordingRunner {
    invocations: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("recorder poisoned").clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &StageCommand) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.commands
            .lock()
            .expect("recorder poisoned")
            .push(command.render());
        for output in &command.outputs {
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(output, b"")?;
        }
        Ok(())
    }
}

/// Run a stage command under the idempotence contract.
///
/// Declared outputs that all exist mean the work is already done; declared
/// inputs that are missing mean an upstream stage failed. After a real run,
/// a missing declared output is an error even if the program exited 0,
/// which catches exception-free partial death.
pub async fn runcmd(runner: &dyn CommandRunner, command: &StageCommand) -> Result<RunOutcome> {
    if !command.outputs.is_empty() && command.outputs.iter().all(|p| p.exists()) {
        tracing::info!(
            cmd = %command.program,
            outputs = command.outputs.len(),
            "All outputs exist, skipping"
        );
        return Ok(RunOutcome::Skipped);
    }

    for input in &command.inputs {
        if !input.exists() {
            return Err(SpecpipeError::MissingDependency(format!(
                "Input {} missing for {}",
                input.display(),
                command.program
            )));
        }
    }

    runner.run(command).await?;

    for output in &command.outputs {
        if !output.exists() {
            return Err(SpecpipeError::PipelineError(format!(
                "{} completed but output {} is missing",
                command.program,
                output.display()
            )));
        }
    }
    Ok(RunOutcome::Ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_runcmd_skips_when_outputs_exist() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("frame.fits");
        std::fs::write(&out, b"").unwrap();

        let runner = RecordingRunner::new();
        let cmd = StageCommand::new("specpipe_extract").output(out);
        let outcome = runcmd(&runner, &cmd).await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped);
        assert_eq!(runner.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_runcmd_requires_inputs() {
        let dir = tempdir().unwrap();
        let runner = RecordingRunner::new();
        let cmd = StageCommand::new("specpipe_extract")
            .input(dir.path().join("missing.fits"))
            .output(dir.path().join("frame.fits"));
        assert!(matches!(
            runcmd(&runner, &cmd).await,
            Err(SpecpipeError::MissingDependency(_))
        ));
        assert_eq!(runner.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_runcmd_flags_missing_outputs_after_run() {
        let dir = tempdir().unwrap();
        let cmd = StageCommand::new("specpipe_extract").output(dir.path().join("frame.fits"));
        // DryRunRunner does not create outputs, so the contract check fires.
        let err = runcmd(&DryRunRunner, &cmd).await.unwrap_err();
        assert!(matches!(err, SpecpipeError::PipelineError(_)));
    }

    #[tokio::test]
    async fn test_runcmd_runs_and_verifies() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("sub").join("frame.fits");
        let runner = RecordingRunner::new();
        let cmd = StageCommand::new("specpipe_extract").output(out.clone());
        let outcome = runcmd(&runner, &cmd).await.unwrap();
        assert_eq!(outcome, RunOutcome::Ran);
        assert!(out.exists());
        assert_eq!(runner.invocation_count(), 1);
    }
}
