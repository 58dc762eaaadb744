use super::{read_outputs, step_failed, step_paths, write_file_variables};
use crate::{
  artifacts::{copy_tree, relative_path},
  command::Command,
  docker::Docker,
  paths::{PathTryToString, StepPaths},
  utils::create_executable_file,
  WorkflowLogger,
};
use ci_runner::{Error, Result, ScriptOutputs, ScriptPayload, ScriptRequest};
use std::path::{Path, PathBuf};

/// Runs a step inside a container image.
pub struct ContainerExecutor {
  pub artifact_staging_dir: PathBuf,
  pub logger: WorkflowLogger,
}

impl ContainerExecutor {
  pub fn new(artifact_staging_dir: PathBuf, logger: WorkflowLogger) -> Self {
    ContainerExecutor {
      artifact_staging_dir,
      logger,
    }
  }

  pub async fn run(&self, request: ScriptRequest) -> Result<ScriptOutputs> {
    let paths = step_paths(&request, &self.artifact_staging_dir)?;

    tokio::fs::create_dir_all(&paths.output_dir).await?;

    let docker = self.into_docker(&request, &paths).await?;
    let container_name = docker.name.clone().unwrap_or_default();

    log::trace!("Running container step `{}`", request.step_name);

    let mut command: Command = docker.into();
    let logger = self.logger.scoped(&request.secrets);
    let result = command.run_logged(&logger).await;

    if result.is_err() && !container_name.is_empty() {
      log::trace!("Killing container {}", container_name);
      Command::new(format!("docker kill {}", container_name))
        .exec()
        .await
        .ok();
    }

    if !request.artifact_paths.is_empty() && paths.container_artifacts_dir.exists() {
      let copied = copy_tree(&paths.container_artifacts_dir, &paths.artifact_target_dir).await?;
      log::info!("Collected {} artifact files of `{}`", copied, request.step_name);
    }

    result.map_err(|err| step_failed(&request.step_name, err))?;

    read_outputs(&paths.container_out_env_path(), &request.output_var_names).await
  }

  async fn into_docker(&self, request: &ScriptRequest, paths: &StepPaths) -> Result<Docker> {
    let ScriptPayload::Container {
      image,
      command,
      args,
      script,
      exposed_ports,
      custom_script_mount,
      source_code_mount,
      extra_volume_mounts,
    } = &request.payload
    else {
      return Err(Error::internal_runtime_error(format!(
        "step `{}` is not a container step",
        request.step_name
      )));
    };

    let mut docker = Docker::new(image)
      .name(&paths.container_name)
      .volume(paths.output_dir.try_to_string()?, StepPaths::CONTAINER_OUTPUT_DIR)
      .auto_remove(true);

    match source_code_mount {
      Some(mount) => {
        docker = docker
          .volume(&mount.src_path, &mount.dest_path)
          .working_dir(&mount.dest_path);
      }
      None => docker = docker.working_dir(StepPaths::CONTAINER_OUTPUT_DIR),
    }

    for mount in extra_volume_mounts {
      docker = docker.volume(&mount.src_path, &mount.dest_path);
    }

    for (file, host_path) in write_file_variables(paths, &request.file_variables).await? {
      docker = docker.volume(host_path.try_to_string()?, file.mount_path);
    }

    for artifact_path in &request.artifact_paths {
      let host_dir = paths
        .container_artifacts_dir
        .join(relative_path(Path::new(artifact_path)));
      tokio::fs::create_dir_all(&host_dir).await?;
      docker = docker.volume(host_dir.try_to_string()?, artifact_path);
    }

    for (host, container) in exposed_ports {
      docker = docker.port(*host, *container);
    }

    for (key, value) in &request.env {
      docker = docker.environment(key, value);
    }

    if !script.trim().is_empty() {
      let (host_script, container_script) = match custom_script_mount {
        Some(mount) => (PathBuf::from(&mount.src_path), mount.dest_path.clone()),
        None => (
          paths.script_path.clone(),
          paths.container_script_path(&request.script_name),
        ),
      };

      create_executable_file(&host_script, script).await?;
      docker = docker.volume(host_script.try_to_string()?, &container_script);

      if command.is_empty() {
        docker = docker.entrypoint("/bin/sh").command(container_script);
      }
    }

    if !command.is_empty() {
      docker = docker.entrypoint(command);
    }

    Ok(docker.args(args.iter().cloned()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ci_runner::{EnvironmentVariables, FileVariable, MountPath};
  use std::collections::BTreeMap;

  fn request(work_dir: &Path, payload: ScriptPayload) -> ScriptRequest {
    ScriptRequest {
      step_name: "scan".to_string(),
      script_name: "1_scan".to_string(),
      work_dir: work_dir.to_path_buf(),
      env: EnvironmentVariables::from([("IMAGE".to_string(), "app:1".to_string())]),
      output_var_names: vec!["RESULT".to_string()],
      file_variables: vec![FileVariable {
        name: "CONFIG".to_string(),
        mount_path: "/etc/scan.yaml".to_string(),
        content: "level: high".to_string(),
      }],
      artifact_paths: vec!["/reports".to_string()],
      secrets: vec![],
      payload,
    }
  }

  #[ci_runner_test::test]
  async fn test_container_command_layout() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("process");
    let executor = ContainerExecutor::new(dir.path().join("staging"), WorkflowLogger::stdout());

    let request = request(
      &work_dir,
      ScriptPayload::Container {
        image: "scanner:1".to_string(),
        command: String::new(),
        args: vec![],
        script: "scan $IMAGE > /output/out.env".to_string(),
        exposed_ports: BTreeMap::from([(9000, 9000)]),
        custom_script_mount: None,
        source_code_mount: Some(MountPath::new("/src", "/workspace")),
        extra_volume_mounts: vec![],
      },
    );
    let paths = step_paths(&request, &executor.artifact_staging_dir).unwrap();

    let docker = executor.into_docker(&request, &paths).await.unwrap();
    let command = docker.generate_docker_command();
    let work = work_dir.to_str().unwrap();

    assert!(command.starts_with("docker run --rm -p 9000:9000"));
    assert!(command.contains(&format!("-v '{}/output:/output'", work)));
    assert!(command.contains("-v '/src:/workspace'"));
    assert!(command.contains(&format!("-v '{}/files/CONFIG:/etc/scan.yaml'", work)));
    assert!(command.contains(&format!("-v '{}/opt/1_scan/reports:/reports'", work)));
    assert!(command.contains("-e IMAGE"));
    assert!(command.contains("-w '/workspace'"));
    assert!(command.ends_with(
      "--entrypoint '/bin/sh' --name ci-step-1_scan scanner:1 '/ci-runner/scripts/1_scan.sh'"
    ));
    assert_eq!(
      std::fs::read_to_string(work_dir.join("files/CONFIG")).unwrap(),
      "level: high"
    );
    assert!(work_dir.join("1_scan.sh").exists());
  }

  #[ci_runner_test::test]
  async fn test_explicit_command_and_args() {
    let dir = tempfile::tempdir().unwrap();
    let work_dir = dir.path().join("process");
    let executor = ContainerExecutor::new(dir.path().join("staging"), WorkflowLogger::stdout());

    let mut request = request(
      &work_dir,
      ScriptPayload::Container {
        image: "alpine".to_string(),
        command: "echo".to_string(),
        args: vec!["RESULT=ok".to_string()],
        script: String::new(),
        exposed_ports: BTreeMap::new(),
        custom_script_mount: None,
        source_code_mount: None,
        extra_volume_mounts: vec![],
      },
    );
    request.file_variables.clear();
    request.artifact_paths.clear();
    let paths = step_paths(&request, &executor.artifact_staging_dir).unwrap();

    let command = executor
      .into_docker(&request, &paths)
      .await
      .unwrap()
      .generate_docker_command();

    assert!(command.ends_with("--entrypoint 'echo' --name ci-step-1_scan alpine 'RESULT=ok'"));
    assert!(command.contains("-w '/output'"));
  }
}
