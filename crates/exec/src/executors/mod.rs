mod container;
mod shell;

pub use container::ContainerExecutor;
pub use shell::ShellExecutor;

use crate::{paths::StepPaths, WorkflowLogger};
use ci_runner::{
  parse_output_env, Error, FileVariable, Result, ScriptOutputs, ScriptPayload, ScriptRequest,
  ScriptRunner,
};
use std::path::{Path, PathBuf};

/// Dispatches inline steps to the shell or container executor.
pub struct StepExecutor {
  shell: ShellExecutor,
  container: ContainerExecutor,
}

impl StepExecutor {
  pub fn new(artifact_staging_dir: impl Into<PathBuf>, logger: WorkflowLogger) -> Self {
    let artifact_staging_dir = artifact_staging_dir.into();

    StepExecutor {
      shell: ShellExecutor::new(artifact_staging_dir.clone(), logger.clone()),
      container: ContainerExecutor::new(artifact_staging_dir, logger),
    }
  }
}

#[async_trait::async_trait]
impl ScriptRunner for StepExecutor {
  async fn run(&self, request: ScriptRequest) -> Result<ScriptOutputs> {
    match request.payload {
      ScriptPayload::Shell { .. } => self.shell.run(request).await,
      ScriptPayload::Container { .. } => self.container.run(request).await,
    }
  }
}

pub(crate) fn step_paths(request: &ScriptRequest, staging: &Path) -> Result<StepPaths> {
  StepPaths::builder()
    .work_dir(&request.work_dir)
    .script_name(&request.script_name)
    .artifact_staging_dir(staging)
    .build()
}

/// Writes each file variable under `files_dir` and returns its host path.
pub(crate) async fn write_file_variables(
  paths: &StepPaths,
  files: &[FileVariable],
) -> Result<Vec<(FileVariable, PathBuf)>> {
  if files.is_empty() {
    return Ok(vec![]);
  }

  tokio::fs::create_dir_all(&paths.files_dir).await?;

  let mut written = Vec::with_capacity(files.len());
  for file in files {
    let host_path = paths.file_variable_path(&file.name)?;
    tokio::fs::write(&host_path, &file.content).await?;
    written.push((file.clone(), host_path));
  }

  Ok(written)
}

pub(crate) async fn read_outputs(path: &Path, names: &[String]) -> Result<ScriptOutputs> {
  if names.is_empty() {
    return Ok(ScriptOutputs::new());
  }

  match tokio::fs::read_to_string(path).await {
    Ok(content) => Ok(parse_output_env(&content, names)),
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
      log::warn!("Output file {:?} was not written", path);
      Ok(ScriptOutputs::new())
    }
    Err(err) => Err(err.into()),
  }
}

/// Rewrites a failed command into a step level error.
pub(crate) fn step_failed(step: &str, err: Error) -> Error {
  match err {
    Error::CommandFailed {
      exit_code: Some(code),
      ..
    } => Error::command_failed(
      Some(code),
      format!("step `{}` exited with code {}", step, code),
    ),
    Error::CommandFailed { exit_code: None, message } => {
      Error::command_failed(None, format!("step `{}` failed: {}", step, message))
    }
    other => other,
  }
}
