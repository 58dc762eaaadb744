use crate::{
  BlobCli, Collaborators, Dockerd, DockerdConfig, EventSink, GitCli, HttpEventSink,
  HttpImageScanner, ImageScanner, LogEventSink, RunnerConfig, WorkspaceStorage,
};
use ci_runner::{Result, WorkflowRequest};
use ci_runner_builder::{BuildCommandRunner, BuilderConfig, ImageBuilder, KubeClient, ShellCommandRunner};
use ci_runner_exec::{StepExecutor, WorkflowLogger};
use std::{sync::Arc, time::Duration};

/// Wires the production implementations for `request`.
pub fn collaborators(
  request: &WorkflowRequest,
  config: &RunnerConfig,
  logger: &WorkflowLogger,
) -> Result<Collaborators> {
  let source_dir = request
    .ci_project_details
    .first()
    .map(|material| config.checkout_dir(&material.checkout_path))
    .unwrap_or_else(|| config.working_root.clone());

  let shell: Arc<dyn BuildCommandRunner> = Arc::new(ShellCommandRunner::new(
    &config.working_root,
    logger.clone(),
  ));

  let mut builder_config = BuilderConfig::new(&source_dir, &config.buildx_cache_path);
  builder_config.podinfo_labels_file = config.podinfo_labels_file.clone();
  builder_config.show_build_args = config.show_docker_build_args;

  let mut builder = ImageBuilder::new(
    Arc::new(ShellCommandRunner::new(&source_dir, logger.clone())),
    builder_config,
    logger.clone(),
  );

  let uses_k8s_driver = request
    .docker_build_config()
    .map(|build| build.buildx.uses_k8s_driver())
    .unwrap_or(false);
  if uses_k8s_driver {
    builder = builder.with_pod_api(Arc::new(KubeClient::in_cluster()?));
  }

  let storage = match (&request.blob_storage, request.blob_storage_configured) {
    (Some(blob), true) => {
      let blob = BlobCli::new(
        shell.clone(),
        blob.clone(),
        config.working_root.join(".credentials"),
      );
      Some(Arc::new(WorkspaceStorage::new(
        Arc::new(blob),
        shell.clone(),
        std::env::temp_dir().join("ci-runner"),
      )))
    }
    _ => None,
  };

  let endpoint = config
    .event_endpoint
    .clone()
    .or_else(|| Some(request.orchestrator_host.clone()).filter(|host| !host.is_empty()));
  let events: Arc<dyn EventSink> = match endpoint {
    Some(endpoint) => Arc::new(HttpEventSink::new(endpoint, &request.orchestrator_token)?),
    None => {
      log::warn!("No orchestrator endpoint configured, completion events are only logged");
      Arc::new(LogEventSink)
    }
  };

  let scanner: Option<Arc<dyn ImageScanner>> = if config.image_scanner_endpoint.is_empty() {
    None
  } else {
    Some(Arc::new(HttpImageScanner::new(
      &config.image_scanner_endpoint,
      request.image_scan_max_retries,
      Duration::from_secs(request.image_scan_retry_delay),
    )?))
  };

  Ok(Collaborators {
    steps: Arc::new(StepExecutor::new(
      &config.artifact_staging_dir,
      logger.clone(),
    )),
    builder: Arc::new(builder),
    git: Arc::new(GitCli::new(shell.clone())),
    docker: Arc::new(Dockerd::new(
      shell,
      DockerdConfig::new(&config.docker_daemon_socket, config.docker_start_timeout),
    )),
    storage,
    events,
    scanner,
  })
}
