use crate::{
  append_tasks, system_env, DockerDaemon, EventSink, GitCheckout, ImageBuild, ImageScanRequest,
  ImageScanner, RunnerConfig, StageError, TaskYaml, WorkflowKind, WorkspaceStorage,
};
use chrono::Utc;
use ci_runner::{
  seconds_between, CdCompleteEvent, CiCompleteEvent, CiMetrics, CompletionEvent, Error,
  PluginArtifacts, RefPluginMap, Result, ScriptRunner, StageConfig, StageExecutor, StageKind,
  StageVariables, StepObject, VariableEnvironment, WorkflowRequest, WorkflowType,
};
use ci_runner_exec::WorkflowLogger;
use std::sync::Arc;

pub const PREPARE_STEP: &str = "PREPARE_STEP";
pub const PRE_BUILD: &str = "PRE_BUILD";
pub const POST_BUILD: &str = "POST_BUILD";
pub const DOCKER_BUILD: &str = "DOCKER_BUILD";
pub const PUSH: &str = "PUSH";
pub const IMAGE_SCAN: &str = "IMAGE_SCAN";
pub const UPLOAD_ARTIFACTS: &str = "UPLOAD_ARTIFACTS";
pub const PRE_DEPLOY: &str = "PRE_DEPLOY";
pub const POST_DEPLOY: &str = "POST_DEPLOY";

const DATA_SOURCE: &str = "CI-RUNNER";
const MATERIAL_TYPE: &str = "git";

/// Everything the pipeline talks to outside its own process.
#[derive(Clone)]
pub struct Collaborators {
  pub steps: Arc<dyn ScriptRunner>,
  pub builder: Arc<dyn ImageBuild>,
  pub git: Arc<dyn GitCheckout>,
  pub docker: Arc<dyn DockerDaemon>,
  /// `None` when the request has no blob storage configured
  pub storage: Option<Arc<WorkspaceStorage>>,
  pub events: Arc<dyn EventSink>,
  /// `None` when no scanner endpoint is configured
  pub scanner: Option<Arc<dyn ImageScanner>>,
}

/// Mutable state of one workflow run.
struct Run {
  metrics: CiMetrics,
  env: VariableEnvironment,
  plugin_artifacts: PluginArtifacts,
  upload_attempted: bool,
  is_artifact_uploaded: bool,
  dest: String,
  digest: String,
}

impl Run {
  fn new(env: VariableEnvironment) -> Self {
    Run {
      metrics: CiMetrics::start(),
      env,
      plugin_artifacts: PluginArtifacts::new(),
      upload_attempted: false,
      is_artifact_uploaded: false,
      dest: String::new(),
      digest: String::new(),
    }
  }
}

/// Drives a CI or CD workflow from checkout to completion event.
pub struct Pipeline {
  request: WorkflowRequest,
  config: RunnerConfig,
  logger: WorkflowLogger,
  deps: Collaborators,
}

impl Pipeline {
  pub fn new(
    request: WorkflowRequest,
    config: RunnerConfig,
    logger: WorkflowLogger,
    deps: Collaborators,
  ) -> Self {
    Pipeline {
      request,
      config,
      logger,
      deps,
    }
  }

  pub fn request(&self) -> &WorkflowRequest {
    &self.request
  }

  pub async fn run(&self) -> std::result::Result<(), StageError> {
    match self.request.workflow_type {
      WorkflowType::Ci | WorkflowType::Job => self.run_ci().await,
      WorkflowType::PreCd | WorkflowType::PostCd => self.run_cd().await,
      WorkflowType::Scan => Err(StageError::new(
        WorkflowKind::Ci,
        Error::bad_request("SCAN workflows are run by the image scanner"),
      )),
    }
  }

  fn new_run(&self) -> Run {
    Run::new(VariableEnvironment::new(
      system_env(&self.request, &self.config),
      self.request.runtime_env(),
    ))
  }

  fn executor(&self) -> StageExecutor {
    let mut config = StageConfig::new(self.config.process_dir());
    config.plugin_artifacts_file = self.config.plugin_artifacts_file.clone();
    config.max_ref_plugin_depth = self.config.max_ref_plugin_depth;

    StageExecutor::new(self.deps.steps.clone(), config)
  }

  pub async fn run_ci(&self) -> std::result::Result<(), StageError> {
    let mut run = self.new_run();

    let result = self.ci_flow(&mut run).await;

    let result = match result {
      Ok(()) => {
        run.metrics.finish();
        self
          .send_event(self.ci_event(&run, String::new()))
          .await
      }
      Err(err) => Err(err),
    };

    let result = match result {
      Ok(()) => Ok(()),
      Err(err) => Err(self.fail(WorkflowKind::Ci, run, err).await),
    };

    // Only once the completion event has been sent.
    self.stop_docker().await;
    result
  }

  async fn ci_flow(&self, run: &mut Run) -> Result<()> {
    self.prepare(run, true).await?;

    let mut pre_steps = self.request.pre_ci_steps.clone();
    let mut post_steps = self.request.post_ci_steps.clone();
    self.load_task_yaml(&mut pre_steps, &mut post_steps).await?;

    let executor = self.executor();
    let ref_plugins = Arc::new(self.request.ref_plugin_map());

    let started = Utc::now();
    run.metrics.pre_ci_start_time = Some(started);
    let pre_vars = self
      .run_stage(
        run,
        &executor,
        ref_plugins.clone(),
        StageKind::Pre,
        PRE_BUILD,
        &pre_steps,
        None,
      )
      .await;
    run.metrics.pre_ci_duration = seconds_between(started, Utc::now());
    let pre_vars = pre_vars?;

    if !self.request.is_build_skipped() {
      if let Err(err) = self.build_and_push(run).await {
        run.env.set_system_env("BUILD_SUCCESS", "false");

        let steps = StepObject::filter_trigger_if_parent_stage_fail(&post_steps);
        if !steps.is_empty() {
          let post = self
            .run_stage(
              run,
              &executor,
              ref_plugins,
              StageKind::Post,
              POST_BUILD,
              &steps,
              Some(&pre_vars),
            )
            .await;

          if let Err(post_err) = post {
            log::error!("Post build steps after a failed build failed: {}", post_err);
          }
        }

        return Err(err);
      }

      run.env.set_system_env("BUILD_SUCCESS", "true");
    }

    let started = Utc::now();
    run.metrics.post_ci_start_time = Some(started);
    let post = self
      .run_stage(
        run,
        &executor,
        ref_plugins,
        StageKind::Post,
        POST_BUILD,
        &post_steps,
        Some(&pre_vars),
      )
      .await;
    run.metrics.post_ci_duration = seconds_between(started, Utc::now());

    let upload = self.upload_artifacts(run).await;
    let scan = self.scan_image(run).await;

    post?;
    upload?;
    scan
  }

  pub async fn run_cd(&self) -> std::result::Result<(), StageError> {
    let mut run = self.new_run();

    let result = self.cd_flow(&mut run).await;

    let result = match result {
      Ok(()) if self.request.is_virtual_execution => Ok(()),
      Ok(()) => self.send_event(self.cd_event(&run, String::new())).await,
      Err(err) => Err(err),
    };

    let result = match result {
      Ok(()) => Ok(()),
      Err(err) => Err(self.fail(WorkflowKind::Cd, run, err).await),
    };

    self.stop_docker().await;
    result
  }

  async fn cd_flow(&self, run: &mut Run) -> Result<()> {
    self.prepare(run, false).await?;

    let (kind, stage) = match self.request.workflow_type {
      WorkflowType::PostCd => (StageKind::Post, POST_DEPLOY),
      _ => (StageKind::Pre, PRE_DEPLOY),
    };

    let result = self
      .run_stage(
        run,
        &self.executor(),
        Arc::new(self.request.ref_plugin_map()),
        kind,
        stage,
        &self.request.pre_post_deploy_steps,
        None,
      )
      .await;

    let upload = self.upload_artifacts(run).await;

    result?;
    upload
  }

  /// Uploads artifacts if that was not attempted yet, emits the failure
  /// event and wraps `err`.
  async fn fail(&self, kind: WorkflowKind, mut run: Run, err: Error) -> StageError {
    log::error!("{} workflow failed: {}", kind, err);

    if let Err(upload_err) = self.upload_artifacts(&mut run).await {
      log::error!("Failed to upload artifacts: {}", upload_err);
    }

    run.metrics.finish();

    let event = match kind {
      WorkflowKind::Ci => self.ci_event(&run, err.to_string()),
      WorkflowKind::Cd => self.cd_event(&run, err.to_string()),
    };
    if let Err(event_err) = self.send_event(event).await {
      log::error!("Failed to send failure event: {}", event_err);
    }

    StageError::new(kind, err)
      .with_metrics(run.metrics)
      .with_artifact_uploaded(run.is_artifact_uploaded)
  }

  /// Runs one step list under its stage log and collects its plugin
  /// artifacts.
  #[allow(clippy::too_many_arguments)]
  async fn run_stage(
    &self,
    run: &mut Run,
    executor: &StageExecutor,
    ref_plugins: Arc<RefPluginMap>,
    kind: StageKind,
    stage: &str,
    steps: &[StepObject],
    prior: Option<&StageVariables>,
  ) -> Result<StageVariables> {
    let log = self.logger.start_stage(stage);

    let result = executor
      .run_steps(kind, steps, ref_plugins, &mut run.env, prior, true)
      .await;

    log.finish(result.is_success());
    run.plugin_artifacts.merge(result.plugin_artifacts);

    match result.error {
      Some(err) => {
        if let Some(step) = &result.failed_step {
          log::error!("{} stage failed at step {}", kind, step.display_name());
        }
        Err(err)
      }
      None => Ok(result.output_vars),
    }
  }

  async fn prepare(&self, run: &mut Run, checkout: bool) -> Result<()> {
    let stage = self.logger.start_stage(PREPARE_STEP);
    let result = self.prepare_workspace(run, checkout).await;
    stage.finish_with(result)
  }

  /// Cache pull, checkout and docker start run concurrently; the first
  /// failure wins. Docker starts afterwards unless buildx is used.
  async fn prepare_workspace(&self, run: &mut Run, checkout: bool) -> Result<()> {
    tokio::fs::create_dir_all(self.config.process_dir()).await?;
    tokio::fs::create_dir_all(&self.config.artifact_staging_dir).await?;

    let use_buildx = self
      .request
      .docker_build_config()
      .map(|config| config.use_buildx())
      .unwrap_or(false);

    let cache = async {
      let started = Utc::now();
      let pulled = match self.pull_cache().await {
        Ok(true) => Some(started),
        Ok(false) => None,
        Err(err) => {
          log::warn!("Continuing without build cache: {}", err);
          Some(started)
        }
      };

      Ok::<_, Error>(pulled)
    };

    let sources = async {
      if checkout {
        self.checkout_sources().await?;
      }
      Ok::<_, Error>(())
    };

    let docker = async {
      if use_buildx {
        self.deps.docker.start(&self.request).await?;
      }
      Ok::<_, Error>(())
    };

    let (cache_started, _, _) = tokio::try_join!(cache, sources, docker)?;

    if let Some(started) = cache_started {
      run.metrics.cache_down_start_time = Some(started);
      run.metrics.cache_down_duration = seconds_between(started, Utc::now());
    }

    if !use_buildx {
      self.deps.docker.start(&self.request).await?;
    }

    Ok(())
  }

  /// `Ok(false)` when there is no cache to pull.
  async fn pull_cache(&self) -> Result<bool> {
    let Some(storage) = &self.deps.storage else {
      return Ok(false);
    };

    if !self.request.blob_storage_configured
      || self.request.ignore_docker_cache_pull
      || self.request.is_pvc_mounted
      || self.request.is_build_skipped()
    {
      return Ok(false);
    }

    storage
      .pull_cache(&self.request, &self.config.buildx_cache_path)
      .await?;

    Ok(true)
  }

  async fn checkout_sources(&self) -> Result<()> {
    for material in &self.request.ci_project_details {
      let dir = self.config.checkout_dir(&material.checkout_path);
      self.deps.git.checkout(material, &dir).await?;
    }

    Ok(())
  }

  async fn load_task_yaml(
    &self,
    pre_steps: &mut Vec<StepObject>,
    post_steps: &mut Vec<StepObject>,
  ) -> Result<()> {
    let Some(material) = self.request.ci_project_details.first() else {
      return Ok(());
    };

    let dir = self.config.checkout_dir(&material.checkout_path);
    let Some(tasks) = TaskYaml::load(&dir).await? else {
      return Ok(());
    };

    let (before, after) = tasks.matching_tasks(material);
    log::info!(
      "Task file contributes {} pre and {} post steps",
      before.len(),
      after.len()
    );

    append_tasks(pre_steps, before);
    append_tasks(post_steps, after);

    Ok(())
  }

  async fn build_and_push(&self, run: &mut Run) -> Result<()> {
    let started = Utc::now();
    run.metrics.build_start_time = Some(started);

    let stage = self.logger.start_stage(DOCKER_BUILD);
    let output = stage.finish_with(self.deps.builder.build(&self.request).await);
    run.metrics.build_duration = seconds_between(started, Utc::now());
    let output = output?;

    let stage = self.logger.start_stage(PUSH);
    let digest = stage.finish_with(
      async {
        self.deps.builder.push(&self.request, &output).await?;
        self.deps.builder.digest(&self.request, &output).await
      }
      .await,
    )?;

    log::info!("Built {} with digest {}", output.dest, digest);

    run.env.set_system_env("DEST", output.dest.clone());
    run.env.set_system_env("DIGEST", digest.clone());
    run.dest = output.dest;
    run.digest = digest;

    self.push_cache(run).await;

    Ok(())
  }

  async fn push_cache(&self, run: &mut Run) {
    let Some(storage) = &self.deps.storage else {
      return;
    };

    if !self.request.blob_storage_configured
      || self.request.ignore_docker_cache_push
      || self.request.is_pvc_mounted
    {
      return;
    }

    let started = Utc::now();
    run.metrics.cache_up_start_time = Some(started);

    if let Err(err) = storage
      .push_cache(&self.request, &self.config.buildx_cache_path)
      .await
    {
      log::warn!("Failed to upload build cache: {}", err);
    }

    run.metrics.cache_up_duration = seconds_between(started, Utc::now());
  }

  async fn upload_artifacts(&self, run: &mut Run) -> Result<()> {
    if run.upload_attempted {
      return Ok(());
    }
    run.upload_attempted = true;

    let Some(storage) = &self.deps.storage else {
      return Ok(());
    };

    let stage = self.logger.start_stage(UPLOAD_ARTIFACTS);
    let result = stage.finish_with(
      storage
        .upload_artifacts(
          &self.request,
          &self.config.artifact_staging_dir,
          &self.config.log_file,
        )
        .await,
    );

    match result {
      Ok(uploaded) => {
        run.is_artifact_uploaded = uploaded;
        Ok(())
      }
      Err(err) if self.request.is_ext_run => {
        log::warn!("Ignoring artifact upload failure of external run: {}", err);
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  async fn scan_image(&self, run: &Run) -> Result<()> {
    if !self.request.scan_enabled || run.dest.is_empty() {
      return Ok(());
    }

    let stage = self.logger.start_stage(IMAGE_SCAN);
    let result = match &self.deps.scanner {
      Some(scanner) => {
        scanner
          .scan(&ImageScanRequest::new(&self.request, &run.dest, &run.digest))
          .await
      }
      None => Err(Error::scan_failed("no image scanner endpoint is configured")),
    };

    stage.finish_with(result)
  }

  async fn stop_docker(&self) {
    if let Err(err) = self.deps.docker.stop().await {
      log::warn!("Failed to stop docker daemon: {}", err);
    }
  }

  async fn send_event(&self, event: CompletionEvent) -> Result<()> {
    self.deps.events.send(&event).await
  }

  fn ci_event(&self, run: &Run, failure_reason: String) -> CompletionEvent {
    let request = &self.request;

    CompletionEvent::Ci(CiCompleteEvent {
      ci_project_details: request.ci_project_details.clone(),
      docker_image: run.dest.clone(),
      digest: run.digest.clone(),
      pipeline_id: request.pipeline_id,
      workflow_id: request.workflow_id,
      triggered_by: request.triggered_by,
      pipeline_name: request.pipeline_name.clone(),
      data_source: DATA_SOURCE.to_string(),
      material_type: MATERIAL_TYPE.to_string(),
      metrics: run.metrics.clone(),
      app_name: request.app_name.clone(),
      is_artifact_uploaded: run.is_artifact_uploaded,
      failure_reason,
      image_details_from_cr: None,
      plugin_artifacts: run.plugin_artifacts.clone().into_vec(),
      target_platforms: request
        .docker_build_config()
        .map(|config| config.target_platforms())
        .unwrap_or_default(),
      is_scan_enabled: request.scan_enabled,
    })
  }

  fn cd_event(&self, run: &Run, failure_reason: String) -> CompletionEvent {
    let request = &self.request;

    let stage_type = match request.workflow_type {
      WorkflowType::PostCd => "POST",
      _ => "PRE",
    };

    CompletionEvent::Cd(CdCompleteEvent {
      workflow_id: request.workflow_id,
      workflow_runner_id: request.workflow_runner_id,
      cd_pipeline_id: request.pipeline_id,
      triggered_by: request.triggered_by,
      stage_type: stage_type.to_string(),
      is_artifact_uploaded: run.is_artifact_uploaded,
      failure_reason,
      plugin_artifacts: run.plugin_artifacts.clone().into_vec(),
      is_virtual_execution: request.is_virtual_execution,
    })
  }
}
