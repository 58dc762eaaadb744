use ci_runner::{Error, Result, WorkflowRequest, WorkflowType, DEFAULT_MAX_REF_PLUGIN_DEPTH};
use clap::{ArgAction, Parser};
use std::{path::PathBuf, time::Duration};

fn parse_workflow_type(value: &str) -> std::result::Result<WorkflowType, String> {
  serde_json::from_value(serde_json::Value::String(value.to_uppercase()))
    .map_err(|_| format!("unknown workflow type `{}`", value))
}

/// Runs one CI/CD workflow inside its pod.
#[derive(Parser, Debug, Clone)]
#[command(name = "ci-runner", version, about)]
pub struct RunnerArgs {
  /// File holding the workflow request JSON
  #[arg(long, env = "CI_CD_EVENT_FILE")]
  pub request_file: Option<PathBuf>,

  /// Inline workflow request JSON, wins over --request-file
  #[arg(long, env = "CI_CD_EVENT")]
  pub request: Option<String>,

  /// Overrides the request's workflow type (CI, JOB, PRE, POST)
  #[arg(long, value_parser = parse_workflow_type)]
  pub workflow_type: Option<WorkflowType>,

  #[arg(long, env = "SHOW_DOCKER_BUILD_ARGS", default_value_t = true, action = ArgAction::Set)]
  pub show_docker_build_args: bool,

  #[arg(long, env = "WORKING_ROOT", default_value = "/ci-runner")]
  pub working_root: PathBuf,

  #[arg(long, env = "LOG_FILE", default_value = "/tmp/ci-logs.log")]
  pub log_file: PathBuf,

  #[arg(long, env = "ARTIFACT_STAGING_DIR", default_value = "/tmp/ci-artifacts")]
  pub artifact_staging_dir: PathBuf,

  /// Defaults to `<working root>/process/pluginArtifacts.json`
  #[arg(long, env = "PLUGIN_ARTIFACTS_FILE")]
  pub plugin_artifacts_file: Option<PathBuf>,

  #[arg(long, env = "BUILDX_CACHE_PATH", default_value = "/var/lib/ci-runner/buildx")]
  pub buildx_cache_path: PathBuf,

  #[arg(long, env = "DOCKER_DAEMON_SOCKET", default_value = "unix:///var/run/docker.sock")]
  pub docker_daemon_socket: String,

  #[arg(long, env = "PODINFO_LABELS_FILE", default_value = "/etc/podinfo/labels")]
  pub podinfo_labels_file: PathBuf,

  #[arg(long, env = "IMAGE_SCANNER_ENDPOINT", default_value = "")]
  pub image_scanner_endpoint: String,

  /// Orchestrator base URL, defaults to the request's `orchestratorHost`
  #[arg(long, env = "EVENT_ENDPOINT")]
  pub event_endpoint: Option<String>,

  #[arg(long, env = "MAX_REF_PLUGIN_DEPTH", default_value_t = DEFAULT_MAX_REF_PLUGIN_DEPTH)]
  pub max_ref_plugin_depth: usize,

  #[arg(long, env = "DOCKER_START_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
  pub docker_start_timeout: Duration,

  #[arg(long, env = "LOG_LEVEL", default_value = "info")]
  pub log_level: String,
}

/// Resolved runner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
  pub working_root: PathBuf,
  pub log_file: PathBuf,
  pub artifact_staging_dir: PathBuf,
  pub plugin_artifacts_file: PathBuf,
  pub buildx_cache_path: PathBuf,
  pub docker_daemon_socket: String,
  pub docker_start_timeout: Duration,
  pub podinfo_labels_file: PathBuf,
  pub image_scanner_endpoint: String,
  pub event_endpoint: Option<String>,
  pub show_docker_build_args: bool,
  pub max_ref_plugin_depth: usize,
}

impl RunnerConfig {
  pub fn new(working_root: impl Into<PathBuf>) -> Self {
    let working_root = working_root.into();

    RunnerConfig {
      plugin_artifacts_file: working_root.join("process").join("pluginArtifacts.json"),
      working_root,
      log_file: PathBuf::from("/tmp/ci-logs.log"),
      artifact_staging_dir: PathBuf::from("/tmp/ci-artifacts"),
      buildx_cache_path: PathBuf::from("/var/lib/ci-runner/buildx"),
      docker_daemon_socket: "unix:///var/run/docker.sock".to_string(),
      docker_start_timeout: Duration::from_secs(60),
      podinfo_labels_file: PathBuf::from("/etc/podinfo/labels"),
      image_scanner_endpoint: String::new(),
      event_endpoint: None,
      show_docker_build_args: true,
      max_ref_plugin_depth: DEFAULT_MAX_REF_PLUGIN_DEPTH,
    }
  }

  /// Per-step working directory.
  pub fn process_dir(&self) -> PathBuf {
    self.working_root.join("process")
  }

  /// Where a material with `checkout_path` is cloned to.
  pub fn checkout_dir(&self, checkout_path: &str) -> PathBuf {
    let path = checkout_path.trim_start_matches("./").trim_start_matches('/');

    if path.is_empty() {
      self.working_root.clone()
    } else {
      self.working_root.join(path)
    }
  }
}

impl From<&RunnerArgs> for RunnerConfig {
  fn from(args: &RunnerArgs) -> Self {
    let mut config = RunnerConfig::new(&args.working_root);

    if let Some(file) = &args.plugin_artifacts_file {
      config.plugin_artifacts_file = file.clone();
    }

    RunnerConfig {
      log_file: args.log_file.clone(),
      artifact_staging_dir: args.artifact_staging_dir.clone(),
      buildx_cache_path: args.buildx_cache_path.clone(),
      docker_daemon_socket: args.docker_daemon_socket.clone(),
      docker_start_timeout: args.docker_start_timeout,
      podinfo_labels_file: args.podinfo_labels_file.clone(),
      image_scanner_endpoint: args.image_scanner_endpoint.clone(),
      event_endpoint: args.event_endpoint.clone().filter(|e| !e.is_empty()),
      show_docker_build_args: args.show_docker_build_args,
      max_ref_plugin_depth: args.max_ref_plugin_depth,
      ..config
    }
  }
}

impl RunnerArgs {
  pub fn load_request(&self) -> Result<WorkflowRequest> {
    let json = match (&self.request, &self.request_file) {
      (Some(inline), _) if !inline.trim().is_empty() => inline.clone(),
      (_, Some(path)) => std::fs::read_to_string(path).map_err(|err| {
        Error::bad_request(format!(
          "Failed to read workflow request {}: {}",
          path.display(),
          err
        ))
      })?,
      _ => {
        return Err(Error::bad_request(
          "No workflow request, set CI_CD_EVENT or CI_CD_EVENT_FILE",
        ))
      }
    };

    let mut request = WorkflowRequest::from_json(&json)?;

    if let Some(workflow_type) = self.workflow_type {
      request.workflow_type = workflow_type;
    }

    Ok(request)
  }
}
