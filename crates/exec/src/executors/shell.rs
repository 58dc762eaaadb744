use super::{read_outputs, step_failed, step_paths, write_file_variables};
use crate::{
  artifacts::collect_artifacts, command::Command, paths::PathTryToString,
  utils::{create_executable_file, shell_quote},
  WorkflowLogger,
};
use ci_runner::{Error, Result, ScriptOutputs, ScriptPayload, ScriptRequest};
use std::path::PathBuf;

/// Runs a step script on the runner host.
pub struct ShellExecutor {
  pub artifact_staging_dir: PathBuf,
  pub logger: WorkflowLogger,
}

impl ShellExecutor {
  pub fn new(artifact_staging_dir: PathBuf, logger: WorkflowLogger) -> Self {
    ShellExecutor {
      artifact_staging_dir,
      logger,
    }
  }

  pub async fn run(&self, request: ScriptRequest) -> Result<ScriptOutputs> {
    let ScriptPayload::Shell { script } = &request.payload else {
      return Err(Error::internal_runtime_error(format!(
        "step `{}` is not a shell step",
        request.step_name
      )));
    };

    let paths = step_paths(&request, &self.artifact_staging_dir)?;
    tokio::fs::create_dir_all(&paths.work_dir).await?;

    let mut env = request.env.clone();
    for (file, host_path) in write_file_variables(&paths, &request.file_variables).await? {
      env.insert(file.name, host_path.try_to_string()?);
    }

    create_executable_file(&paths.script_path, script).await?;

    let mut command = Command::new(shell_quote(&paths.script_path.try_to_string()?));
    command.dir(&paths.work_dir).envs(&env);

    log::trace!("Running shell step `{}`", request.step_name);

    let logger = self.logger.scoped(&request.secrets);
    let result = command.run_logged(&logger).await;

    let copied = collect_artifacts(
      &request.artifact_paths,
      &paths.work_dir,
      &paths.artifact_target_dir,
    )
    .await?;
    if copied > 0 {
      log::info!("Collected {} artifact files of `{}`", copied, request.step_name);
    }

    result.map_err(|err| step_failed(&request.step_name, err))?;

    read_outputs(&paths.out_env_path, &request.output_var_names).await
  }
}
