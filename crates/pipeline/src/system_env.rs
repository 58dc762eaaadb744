use crate::RunnerConfig;
use ci_runner::{EnvironmentVariables, WorkflowRequest, WorkflowType};

/// Values every step of the workflow sees unless a step overrides them.
pub fn system_env(request: &WorkflowRequest, config: &RunnerConfig) -> EnvironmentVariables {
  let mut env = EnvironmentVariables::new();
  let mut set = |key: &str, value: String| {
    env.insert(key.to_string(), value);
  };

  set(
    "WORKING_DIRECTORY",
    config.process_dir().to_string_lossy().to_string(),
  );
  set("DOCKER_IMAGE_TAG", request.docker_image_tag.clone());
  set("DOCKER_REPOSITORY", request.docker_repository.clone());
  set("DOCKER_REGISTRY_URL", request.docker_registry_url.clone());
  set(
    "DOCKER_REGISTRY_TYPE",
    request.docker_registry_type.as_str().to_string(),
  );
  set("DOCKER_USERNAME", request.docker_username.clone());
  set("DOCKER_PASSWORD", request.docker_password.clone());
  set("ACCESS_KEY", request.access_key.clone());
  set("SECRET_KEY", request.secret_key.clone());
  set("AWS_REGION", request.aws_region.clone());
  set("TRIGGER_BY_AUTHOR", request.trigger_by_author.clone());
  set("GIT_MATERIAL_REQUEST", request.git_material_request());
  set("IMAGE_SCANNER_ENDPOINT", config.image_scanner_endpoint.clone());
  set("PIPELINE_ID", request.pipeline_id.to_string());
  set("TRIGGERED_BY", request.triggered_by.to_string());

  if request.workflow_type == WorkflowType::Job {
    set("JOB_NAME", request.app_name.clone());
  } else {
    set("APP_NAME", request.app_name.clone());
  }

  match (&request.cd_artifact, request.workflow_type.is_cd()) {
    (Some(artifact), true) => {
      set("DOCKER_IMAGE", artifact.image.clone());
      set("DEST", artifact.image.clone());
      set("DIGEST", artifact.image_digest.clone());
      set("CD_TRIGGERED_BY", request.deployment_triggered_by.clone());
      set("CD_TRIGGER_TIME", request.deployment_trigger_time.clone());
    }
    _ => set("DOCKER_IMAGE", request.destination_image()),
  }

  env
}
