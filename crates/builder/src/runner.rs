use ci_runner::{EnvironmentVariables, Result};
use ci_runner_exec::{Command, WorkflowLogger};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// A shell command plus the environment it needs. Secrets go in `env` so
/// they stay off the command line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandSpec {
  pub script: String,
  pub env: EnvironmentVariables,
}

impl CommandSpec {
  pub fn new(script: impl Into<String>) -> Self {
    CommandSpec {
      script: script.into(),
      env: EnvironmentVariables::new(),
    }
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }
}

impl From<&str> for CommandSpec {
  fn from(script: &str) -> Self {
    CommandSpec::new(script)
  }
}

impl From<String> for CommandSpec {
  fn from(script: String) -> Self {
    CommandSpec::new(script)
  }
}

/// Executes the builder's external commands.
#[async_trait::async_trait]
pub trait BuildCommandRunner: Send + Sync {
  /// Streams the command's output into the workflow log. Cancelling
  /// `cancel` kills the command.
  async fn run(&self, command: &CommandSpec, cancel: CancellationToken) -> Result<()>;

  /// Runs the command and returns its stdout.
  async fn output(&self, command: &CommandSpec) -> Result<String>;
}

/// Runs commands with `sh -c` inside the source checkout.
pub struct ShellCommandRunner {
  pub dir: PathBuf,
  pub logger: WorkflowLogger,
}

impl ShellCommandRunner {
  pub fn new(dir: impl Into<PathBuf>, logger: WorkflowLogger) -> Self {
    ShellCommandRunner {
      dir: dir.into(),
      logger,
    }
  }

  fn command(&self, spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.script);
    command.envs(&spec.env);
    if self.dir.exists() {
      command.dir(&self.dir);
    }
    command
  }
}

#[async_trait::async_trait]
impl BuildCommandRunner for ShellCommandRunner {
  async fn run(&self, spec: &CommandSpec, cancel: CancellationToken) -> Result<()> {
    let mut command = self.command(spec);
    command.cancel_on(cancel);
    command.run_logged(&self.logger).await
  }

  async fn output(&self, spec: &CommandSpec) -> Result<String> {
    self.command(spec).exec().await
  }
}
