use crate::{
  buildkitd_config, digest_from_metadata, digest_from_pull_output, login, pack_build_command,
  push_with_retry, read_podinfo_labels, registry_credentials, registry_host,
  remove_builder_command, should_invalidate_cache, tag_command, write_language_file,
  BuildCommand, BuildCommandRunner, BuilderPodApi, BuildxCache, BuildxDriver, CacheExport,
  CacheMode, CommandSpec, ImageReference, LivenessWatcher, NodeState, RegistryClient,
};
use ci_runner::{
  BuildpackConfig, CiBuildType, DockerBuildConfig, Error, RegistryConnection, Result,
  WorkflowRequest,
};
use ci_runner_exec::WorkflowLogger;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const MANAGED_DOCKERFILE: &str = ".ci-runner.Dockerfile";

#[derive(Debug, Clone)]
pub struct BuilderConfig {
  /// Checkout the build runs in; dockerfile and context are relative to it.
  pub source_dir: PathBuf,
  /// Holds the buildx metadata file, buildkitd.toml and the local cache.
  pub buildx_dir: PathBuf,
  pub podinfo_labels_file: PathBuf,
  pub certs_dir: PathBuf,
  pub show_build_args: bool,
  pub pod_poll_interval: Duration,
  pub pod_ready_timeout: Duration,
  pub pod_ready_poll: Duration,
  pub retry_delay: Duration,
}

impl BuilderConfig {
  pub fn new(source_dir: impl Into<PathBuf>, buildx_dir: impl Into<PathBuf>) -> Self {
    BuilderConfig {
      source_dir: source_dir.into(),
      buildx_dir: buildx_dir.into(),
      podinfo_labels_file: PathBuf::from("/etc/podinfo/labels"),
      certs_dir: PathBuf::from("/etc/docker/certs.d"),
      show_build_args: true,
      pod_poll_interval: Duration::from_secs(10),
      pod_ready_timeout: Duration::from_secs(120),
      pod_ready_poll: Duration::from_secs(2),
      retry_delay: Duration::from_secs(1),
    }
  }

  pub fn metadata_file(&self) -> PathBuf {
    self.buildx_dir.join("manifest.json")
  }

  pub fn buildkitd_config_file(&self) -> PathBuf {
    self.buildx_dir.join("buildkitd.toml")
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutput {
  pub dest: String,
  /// Digest from the buildx metadata file, if the build produced one.
  pub digest: Option<String>,
  /// Buildx builds push as part of the build.
  pub pushed: bool,
}

pub struct ImageBuilder {
  runner: Arc<dyn BuildCommandRunner>,
  pods: Option<Arc<dyn BuilderPodApi>>,
  logger: WorkflowLogger,
  config: BuilderConfig,
  env: BTreeMap<String, String>,
}

impl ImageBuilder {
  pub fn new(
    runner: Arc<dyn BuildCommandRunner>,
    config: BuilderConfig,
    logger: WorkflowLogger,
  ) -> Self {
    ImageBuilder {
      runner,
      pods: None,
      logger,
      config,
      env: std::env::vars().collect(),
    }
  }

  pub fn with_pod_api(mut self, api: Arc<dyn BuilderPodApi>) -> Self {
    self.pods = Some(api);
    self
  }

  /// Environment `$devtron_env_` values are resolved against.
  pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn config(&self) -> &BuilderConfig {
    &self.config
  }

  pub async fn build_artifact(&self, request: &WorkflowRequest) -> Result<BuildOutput> {
    match request.build_type() {
      CiBuildType::BuildSkip => Err(Error::bad_request("build is skipped for this workflow")),
      CiBuildType::Buildpack => {
        let config = request
          .ci_build_config
          .as_ref()
          .and_then(|config| config.buildpack_config.as_ref())
          .ok_or_else(|| Error::bad_request("buildpack build without buildpackConfig"))?;

        self.build_with_buildpack(request, config).await
      }
      build_type => {
        let mut config = request
          .docker_build_config()
          .cloned()
          .ok_or_else(|| Error::bad_request("docker build without dockerBuildConfig"))?;

        if build_type == CiBuildType::ManagedDockerfile {
          let path = self.config.source_dir.join(MANAGED_DOCKERFILE);
          tokio::fs::write(&path, &config.dockerfile_content).await?;
          config.dockerfile_path = path.to_string_lossy().to_string();
        }

        login(request, self.runner.as_ref()).await?;

        if config.use_buildx() {
          self.build_with_buildx(request, &config).await
        } else {
          self.build_with_docker(request, &config).await
        }
      }
    }
  }

  /// Pushes images that were not pushed by the build itself.
  pub async fn push(&self, request: &WorkflowRequest, output: &BuildOutput) -> Result<()> {
    if output.pushed {
      return Ok(());
    }

    if request.build_type() == CiBuildType::Buildpack {
      login(request, self.runner.as_ref()).await?;
    }

    push_with_retry(
      self.runner.as_ref(),
      &output.dest,
      request.image_retry_count,
      Duration::from_secs(request.image_retry_interval),
    )
    .await
  }

  /// Buildx metadata first, then the registry API, then `docker pull`.
  /// `useDockerApiToGetDigest` puts the registry API first.
  pub async fn extract_digest(
    &self,
    request: &WorkflowRequest,
    output: &BuildOutput,
  ) -> Result<String> {
    if !request.use_docker_api_to_get_digest {
      if let Some(digest) = &output.digest {
        return Ok(digest.clone());
      }
    }

    match self.digest_from_registry(request, &output.dest).await {
      Ok(digest) => return Ok(digest),
      Err(err) => log::warn!("Registry API digest lookup failed: {}", err),
    }

    if let Some(digest) = &output.digest {
      return Ok(digest.clone());
    }

    let pull = self
      .runner
      .output(&CommandSpec::new(format!("docker pull {}", output.dest)))
      .await
      .map_err(|err| Error::digest_extract_failed(format!("docker pull failed: {}", err)))?;

    digest_from_pull_output(&pull).ok_or_else(|| {
      Error::digest_extract_failed(format!("no digest found for {}", output.dest))
    })
  }

  async fn digest_from_registry(&self, request: &WorkflowRequest, dest: &str) -> Result<String> {
    let insecure = request.docker_connection == RegistryConnection::Insecure;
    let image = ImageReference::parse(dest)?;
    let credentials = registry_credentials(request, self.runner.as_ref()).await?;

    RegistryClient::new(insecure)?
      .manifest_digest(&image, credentials.as_ref(), insecure)
      .await
  }

  async fn build_with_docker(
    &self,
    request: &WorkflowRequest,
    config: &DockerBuildConfig,
  ) -> Result<BuildOutput> {
    let dest = request.destination_image();
    let command = BuildCommand::from_config(false, config, &self.env)
      .no_cache(should_invalidate_cache(request))
      .tag(format!("{}:latest", request.docker_repository));

    self.log_build_command(&command);
    self
      .runner
      .run(&CommandSpec::new(command.render()), CancellationToken::new())
      .await
      .map_err(into_build_failed)?;

    self
      .runner
      .output(&CommandSpec::new(tag_command(&request.docker_repository, &dest)))
      .await
      .map_err(into_build_failed)?;

    Ok(BuildOutput {
      dest,
      digest: None,
      pushed: false,
    })
  }

  async fn build_with_buildpack(
    &self,
    request: &WorkflowRequest,
    config: &BuildpackConfig,
  ) -> Result<BuildOutput> {
    let dest = request.destination_image();

    write_language_file(&self.config.source_dir.join(&config.project_path), config).await?;

    let command = pack_build_command(&dest, config);
    if self.config.show_build_args {
      self.logger.line(&format!("Buildpack command: {}", command));
    }

    self
      .runner
      .run(&CommandSpec::new(command), CancellationToken::new())
      .await
      .map_err(into_build_failed)?;

    if let Err(err) = self
      .runner
      .output(&CommandSpec::new(remove_builder_command(&config.builder_id)))
      .await
    {
      log::warn!("Failed to remove builder image {}: {}", config.builder_id, err);
    }

    Ok(BuildOutput {
      dest,
      digest: None,
      pushed: false,
    })
  }

  async fn build_with_buildx(
    &self,
    request: &WorkflowRequest,
    config: &DockerBuildConfig,
  ) -> Result<BuildOutput> {
    let dest = request.destination_image();
    let mut driver = self.new_driver(request, config).await?;

    let result = async {
      self.start_driver(&mut driver).await?;
      self.run_buildx(request, config, &mut driver, &dest).await
    }
    .await;

    self.remove_driver(&mut driver).await;
    result?;

    let digest = digest_from_metadata(&self.config.metadata_file()).await?;

    Ok(BuildOutput {
      dest,
      digest,
      pushed: true,
    })
  }

  async fn new_driver(
    &self,
    request: &WorkflowRequest,
    config: &DockerBuildConfig,
  ) -> Result<BuildxDriver> {
    tokio::fs::create_dir_all(&self.config.buildx_dir).await?;

    let host = registry_host(request);
    let config_file = match buildkitd_config(&host, &request.docker_connection, &self.config.certs_dir)
    {
      Some(content) => {
        let path = self.config.buildkitd_config_file();
        tokio::fs::write(&path, content).await?;
        Some(path)
      }
      None => None,
    };

    if config.buildx.uses_k8s_driver() {
      let labels = read_podinfo_labels(&self.config.podinfo_labels_file);
      Ok(BuildxDriver::kubernetes(&config.buildx, labels, config_file))
    } else {
      Ok(BuildxDriver::single_host(config_file))
    }
  }

  fn watcher(&self, driver: &BuildxDriver) -> Option<LivenessWatcher> {
    match (&self.pods, driver.is_kubernetes()) {
      (Some(api), true) => Some(LivenessWatcher::new(
        api.clone(),
        driver,
        self.config.pod_poll_interval,
      )),
      _ => None,
    }
  }

  async fn start_driver(&self, driver: &mut BuildxDriver) -> Result<()> {
    for command in driver.create_commands() {
      self
        .runner
        .output(&CommandSpec::new(command))
        .await
        .map_err(|err| Error::build_failed(format!("failed to create buildx builder: {}", err)))?;
    }
    driver.transition_all(NodeState::Created)?;

    if let Some(command) = driver.bootstrap_command() {
      self
        .runner
        .output(&CommandSpec::new(command))
        .await
        .map_err(|err| Error::build_failed(format!("failed to bootstrap buildx builder: {}", err)))?;
    }

    if let Some(watcher) = self.watcher(driver) {
      watcher
        .wait_until_ready(self.config.pod_ready_timeout, self.config.pod_ready_poll)
        .await?;
    }
    driver.transition_all(NodeState::Ready)
  }

  async fn remove_driver(&self, driver: &mut BuildxDriver) {
    for command in driver.cleanup_commands() {
      if let Err(err) = self.runner.output(&CommandSpec::new(&command)).await {
        log::warn!("Buildx cleanup `{}` failed: {}", command, err);
      }
    }

    if let Err(err) = driver.transition_all(NodeState::Absent) {
      log::warn!("{}", err);
    }
  }

  async fn run_buildx(
    &self,
    request: &WorkflowRequest,
    config: &DockerBuildConfig,
    driver: &mut BuildxDriver,
    dest: &str,
  ) -> Result<()> {
    let platforms = config.target_platforms();
    let base = BuildCommand::from_config(true, config, &self.env)
      .no_cache(should_invalidate_cache(request))
      .tag(dest);

    let mut command = base
      .clone()
      .platforms(&platforms)
      .push()
      .metadata_file(self.config.metadata_file().to_string_lossy());

    let cache = if request.cache_enabled() {
      let export = if config.buildx.async_cache_export && driver.is_kubernetes() {
        CacheExport::PerPlatform
      } else {
        CacheExport::Inline
      };
      let cache = BuildxCache::new(
        &self.config.buildx_dir,
        CacheMode::from_use_min(config.buildx.use_cache_min),
        export,
      );
      cache.prepare().await?;
      command = cache.apply(command, &platforms);
      Some(cache)
    } else {
      None
    };

    self.build_with_retry(request, driver, &command).await?;

    if let Some(cache) = cache {
      self
        .export_caches(cache.export_commands(&base, &platforms))
        .await;
    }

    Ok(())
  }

  /// Re-runs the build after builder pods were lost, up to
  /// `buildxInterruptionMaxRetry` attempts in total.
  async fn build_with_retry(
    &self,
    request: &WorkflowRequest,
    driver: &mut BuildxDriver,
    command: &BuildCommand,
  ) -> Result<()> {
    let max_attempts = request.buildx_interruption_max_retry.max(1);
    let watcher = self.watcher(driver);
    let mut attempt = 0;

    loop {
      attempt += 1;

      let result = match self.recover_builders(driver, watcher.as_ref()).await {
        Ok(()) => {
          driver.transition_all(NodeState::Running)?;
          self.run_build_once(command, watcher.as_ref()).await
        }
        Err(err) => Err(err),
      };

      match result {
        Ok(()) => {
          driver.transition_all(NodeState::Done)?;
          return Ok(());
        }
        Err(err) if err.is_builder_pod_deleted() => {
          if driver.nodes().iter().any(|n| n.state() == NodeState::Running) {
            driver.transition_all(NodeState::Interrupted)?;
          }

          if attempt >= max_attempts {
            return Err(Error::build_failed(format!(
              "builder pods were interrupted on all {} attempts: {}",
              max_attempts, err
            )));
          }

          log::warn!(
            "Build attempt {}/{} interrupted, retrying: {}",
            attempt,
            max_attempts,
            err
          );
          tokio::time::sleep(self.config.retry_delay).await;
        }
        Err(err) => return Err(err),
      }
    }
  }

  /// Restarts interrupted nodes and waits for their pods.
  async fn recover_builders(
    &self,
    driver: &mut BuildxDriver,
    watcher: Option<&LivenessWatcher>,
  ) -> Result<()> {
    let interrupted = driver
      .nodes()
      .iter()
      .any(|node| node.state() == NodeState::Interrupted);

    let (Some(api), Some(watcher)) = (&self.pods, watcher) else {
      return Ok(());
    };

    if !interrupted {
      return Ok(());
    }

    for node in driver.nodes() {
      if let Err(err) = api.restart_builder(&node.namespace, &node.name).await {
        log::warn!("Failed to restart builder node {}: {}", node.name, err);
      }
    }

    watcher
      .wait_until_ready(self.config.pod_ready_timeout, self.config.pod_ready_poll)
      .await?;

    driver.transition_all(NodeState::Ready)
  }

  async fn run_build_once(
    &self,
    command: &BuildCommand,
    watcher: Option<&LivenessWatcher>,
  ) -> Result<()> {
    self.log_build_command(command);

    let token = CancellationToken::new();
    let watch = watcher.map(|watcher| watcher.clone().spawn(token.clone()));

    let result = self
      .runner
      .run(&CommandSpec::new(command.render()), token)
      .await;

    let lost = match watch {
      Some(watch) => watch.stop().await,
      None => None,
    };

    match (result, lost) {
      (Ok(()), Some(reason)) => {
        log::warn!("Build finished even though builder pods were lost: {}", reason);
        Ok(())
      }
      (Err(_), Some(reason)) => Err(Error::builder_pod_deleted(reason)),
      (result, None) => result.map_err(into_build_failed),
    }
  }

  /// Runs every export and waits for all of them. Failed exports only cost
  /// the next build its cache.
  async fn export_caches(&self, commands: Vec<BuildCommand>) {
    let mut exports = JoinSet::new();

    for command in commands {
      let runner = self.runner.clone();
      self.log_build_command(&command);

      exports.spawn(async move {
        let spec = CommandSpec::new(command.render());
        runner.run(&spec, CancellationToken::new()).await
      });
    }

    while let Some(result) = exports.join_next().await {
      match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("Cache export failed: {}", err),
        Err(err) => log::warn!("Cache export task failed: {}", err),
      }
    }
  }

  fn log_build_command(&self, command: &BuildCommand) {
    if self.config.show_build_args {
      self.logger.line(&format!("Docker build command: {}", command));
    }
  }
}

fn into_build_failed(err: Error) -> Error {
  match err {
    Error::CommandFailed { message, .. } => Error::build_failed(message),
    other => other,
  }
}
