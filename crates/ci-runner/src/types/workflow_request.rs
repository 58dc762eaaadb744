use crate::{
  normalize_environment, ref_plugin_map, EnvironmentVariable, EnvironmentVariables, Error,
  RefPluginMap, RefPluginObject, Result, StepObject,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowType {
  #[default]
  #[serde(rename = "CI")]
  Ci,
  #[serde(rename = "JOB")]
  Job,
  #[serde(rename = "PRE")]
  PreCd,
  #[serde(rename = "POST")]
  PostCd,
  #[serde(rename = "SCAN")]
  Scan,
}

impl WorkflowType {
  pub fn is_ci(&self) -> bool {
    matches!(self, WorkflowType::Ci | WorkflowType::Job)
  }

  pub fn is_cd(&self) -> bool {
    matches!(self, WorkflowType::PreCd | WorkflowType::PostCd)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryType {
  Ecr,
  Gcr,
  ArtifactRegistry,
  DockerHub,
  Acr,
  Quay,
  #[default]
  #[serde(other)]
  Other,
}

impl RegistryType {
  pub fn as_str(&self) -> &'static str {
    match self {
      RegistryType::Ecr => "ecr",
      RegistryType::Gcr => "gcr",
      RegistryType::ArtifactRegistry => "artifact-registry",
      RegistryType::DockerHub => "docker-hub",
      RegistryType::Acr => "acr",
      RegistryType::Quay => "quay",
      RegistryType::Other => "other",
    }
  }

  /// Registries authenticated with a JSON service-account key.
  pub fn uses_json_key(&self) -> bool {
    matches!(self, RegistryType::Gcr | RegistryType::ArtifactRegistry)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryConnection {
  #[default]
  Secure,
  Insecure,
  SecureWithCert,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiBuildType {
  #[default]
  SelfDockerfile,
  ManagedDockerfile,
  Buildpack,
  BuildSkip,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildxK8sNode {
  pub name: Option<String>,
  pub platform: String,
  pub namespace: String,
  /// Extra `--driver-opt` entries, e.g. `nodeselector`, `tolerations`
  pub driver_options: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildxConfig {
  pub enabled: bool,
  pub nodes: Vec<BuildxK8sNode>,
  pub driver_image: Option<String>,
  /// Export caches per platform after the main build
  pub async_cache_export: bool,
  pub use_cache_min: bool,
}

impl BuildxConfig {
  pub fn uses_k8s_driver(&self) -> bool {
    self.enabled && !self.nodes.is_empty()
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerBuildConfig {
  pub dockerfile_path: String,
  /// Inline Dockerfile for `MANAGED_DOCKERFILE` builds
  pub dockerfile_content: String,
  pub build_context: String,
  pub args: BTreeMap<String, String>,
  pub docker_build_options: BTreeMap<String, String>,
  /// Comma separated, e.g. `linux/amd64,linux/arm64`
  pub target_platform: String,
  pub buildx: BuildxConfig,
}

impl DockerBuildConfig {
  pub fn target_platforms(&self) -> Vec<String> {
    self
      .target_platform
      .split(',')
      .map(|p| p.trim().to_string())
      .filter(|p| !p.is_empty())
      .collect()
  }

  pub fn use_buildx(&self) -> bool {
    self.buildx.enabled || !self.target_platform.is_empty()
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildpackConfig {
  pub builder_id: String,
  pub language: String,
  pub language_version: String,
  pub build_packs: Vec<String>,
  pub args: BTreeMap<String, String>,
  pub project_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CiBuildConfig {
  pub ci_build_type: CiBuildType,
  pub docker_build_config: Option<DockerBuildConfig>,
  pub buildpack_config: Option<BuildpackConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GitSourceType {
  #[default]
  SourceTypeBranchFixed,
  SourceTypeTagAny,
  Webhook,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GitOptions {
  pub user_name: String,
  pub password: String,
  pub ssh_private_key: String,
  pub auth_mode: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GitMaterial {
  pub git_repository: String,
  pub material_name: String,
  pub checkout_path: String,
  pub commit_hash: String,
  pub commit_time: String,
  pub source_type: GitSourceType,
  /// Branch name or tag depending on `source_type`
  pub source_value: String,
  pub author: String,
  pub message: String,
  pub git_options: GitOptions,
  pub fetch_submodules: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlobStorageProvider {
  #[default]
  S3,
  Minio,
  Gcp,
  Azure,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BlobStorageConfig {
  pub provider: BlobStorageProvider,
  pub bucket: String,
  pub region: String,
  pub endpoint: String,
  pub access_key: String,
  pub secret_key: String,
  pub gcp_credentials_json: String,
  pub azure_account_name: String,
  pub azure_account_key: String,
  pub part_size_mb: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CdArtifact {
  pub image: String,
  pub image_digest: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkflowRequest {
  pub workflow_id: i64,
  pub workflow_runner_id: i64,
  pub workflow_name_prefix: String,
  #[serde(rename = "type")]
  pub workflow_type: WorkflowType,
  pub pipeline_id: i64,
  pub pipeline_name: String,
  pub app_id: i64,
  pub app_name: String,
  pub environment_id: i64,
  pub ci_artifact_id: i64,

  // Registry
  pub docker_registry_id: String,
  pub docker_registry_type: RegistryType,
  #[serde(rename = "dockerRegistryURL", alias = "dockerRegistryUrl")]
  pub docker_registry_url: String,
  pub docker_connection: RegistryConnection,
  pub docker_cert: String,
  pub docker_repository: String,
  pub docker_image_tag: String,
  pub docker_username: String,
  pub docker_password: String,
  pub aws_region: String,
  pub access_key: String,
  pub secret_key: String,

  // Source
  pub ci_project_details: Vec<GitMaterial>,
  pub trigger_by_author: String,
  pub triggered_by: i64,

  // Steps
  pub pre_ci_steps: Vec<StepObject>,
  pub post_ci_steps: Vec<StepObject>,
  pub pre_post_deploy_steps: Vec<StepObject>,
  pub ref_plugins: Vec<RefPluginObject>,
  pub runtime_environment_variables: HashMap<String, EnvironmentVariable>,
  /// Values masked in the workflow log
  pub secrets: Vec<String>,

  // Build
  pub ci_build_config: Option<CiBuildConfig>,
  pub cache_invalidate: bool,
  pub is_pvc_mounted: bool,
  pub ignore_docker_cache_push: bool,
  pub ignore_docker_cache_pull: bool,
  pub image_retry_count: u32,
  pub image_retry_interval: u64,
  pub buildx_interruption_max_retry: u32,
  pub use_docker_api_to_get_digest: bool,

  // Blob storage
  pub blob_storage_configured: bool,
  pub blob_storage: Option<BlobStorageConfig>,
  pub ci_cache_location: String,
  pub ci_cache_file_name: String,
  pub ci_artifact_location: String,
  pub blob_storage_logs_key: String,
  pub is_ext_run: bool,

  // Scan
  pub scan_enabled: bool,
  pub image_scan_max_retries: u32,
  pub image_scan_retry_delay: u64,

  // CD
  pub cd_artifact: Option<CdArtifact>,
  pub deployment_triggered_by: String,
  pub deployment_trigger_time: String,
  pub is_virtual_execution: bool,

  // Orchestrator callback
  pub orchestrator_host: String,
  pub orchestrator_token: String,
}

impl Default for WorkflowRequest {
  fn default() -> Self {
    WorkflowRequest {
      workflow_id: 0,
      workflow_runner_id: 0,
      workflow_name_prefix: String::new(),
      workflow_type: WorkflowType::Ci,
      pipeline_id: 0,
      pipeline_name: String::new(),
      app_id: 0,
      app_name: String::new(),
      environment_id: 0,
      ci_artifact_id: 0,
      docker_registry_id: String::new(),
      docker_registry_type: RegistryType::Other,
      docker_registry_url: String::new(),
      docker_connection: RegistryConnection::Secure,
      docker_cert: String::new(),
      docker_repository: String::new(),
      docker_image_tag: String::new(),
      docker_username: String::new(),
      docker_password: String::new(),
      aws_region: String::new(),
      access_key: String::new(),
      secret_key: String::new(),
      ci_project_details: vec![],
      trigger_by_author: String::new(),
      triggered_by: 0,
      pre_ci_steps: vec![],
      post_ci_steps: vec![],
      pre_post_deploy_steps: vec![],
      ref_plugins: vec![],
      runtime_environment_variables: HashMap::new(),
      secrets: vec![],
      ci_build_config: None,
      cache_invalidate: false,
      is_pvc_mounted: false,
      ignore_docker_cache_push: false,
      ignore_docker_cache_pull: false,
      image_retry_count: 0,
      image_retry_interval: 5,
      buildx_interruption_max_retry: 3,
      use_docker_api_to_get_digest: false,
      blob_storage_configured: false,
      blob_storage: None,
      ci_cache_location: String::new(),
      ci_cache_file_name: String::new(),
      ci_artifact_location: String::new(),
      blob_storage_logs_key: String::new(),
      is_ext_run: false,
      scan_enabled: false,
      image_scan_max_retries: 3,
      image_scan_retry_delay: 5,
      cd_artifact: None,
      deployment_triggered_by: String::new(),
      deployment_trigger_time: String::new(),
      is_virtual_execution: false,
      orchestrator_host: String::new(),
      orchestrator_token: String::new(),
    }
  }
}

impl WorkflowRequest {
  pub fn from_json(value: &str) -> Result<Self> {
    serde_json::from_str(value)
      .map_err(|err| Error::bad_request(format!("Failed to parse workflow request: {}", err)))
  }

  pub fn runtime_env(&self) -> EnvironmentVariables {
    normalize_environment(&self.runtime_environment_variables)
  }

  pub fn ref_plugin_map(&self) -> RefPluginMap {
    ref_plugin_map(&self.ref_plugins)
  }

  pub fn docker_build_config(&self) -> Option<&DockerBuildConfig> {
    self
      .ci_build_config
      .as_ref()
      .and_then(|config| config.docker_build_config.as_ref())
  }

  pub fn build_type(&self) -> CiBuildType {
    self
      .ci_build_config
      .as_ref()
      .map(|config| config.ci_build_type)
      .unwrap_or(CiBuildType::BuildSkip)
  }

  pub fn is_build_skipped(&self) -> bool {
    self.build_type() == CiBuildType::BuildSkip || self.workflow_type == WorkflowType::Job
  }

  /// `<registry>/<repository>:<tag>`
  pub fn destination_image(&self) -> String {
    let registry = self
      .docker_registry_url
      .trim_start_matches("https://")
      .trim_start_matches("http://")
      .trim_end_matches('/');

    if registry.is_empty() {
      return format!("{}:{}", self.docker_repository, self.docker_image_tag);
    }

    format!(
      "{}/{}:{}",
      registry, self.docker_repository, self.docker_image_tag
    )
  }

  /// `<repo>,<checkoutPath>,<source>,<commit>|...`
  pub fn git_material_request(&self) -> String {
    self
      .ci_project_details
      .iter()
      .map(|material| {
        format!(
          "{},{},{},{}",
          material.git_repository,
          material.checkout_path,
          material.source_value,
          material.commit_hash
        )
      })
      .collect::<Vec<_>>()
      .join("|")
  }

  pub fn cache_enabled(&self) -> bool {
    self.is_pvc_mounted || (self.blob_storage_configured && self.blob_storage.is_some())
  }

  /// Values that must never appear in the workflow log.
  pub fn secret_values(&self) -> Vec<String> {
    let mut secrets: Vec<String> = [
      &self.docker_password,
      &self.secret_key,
      &self.orchestrator_token,
    ]
    .into_iter()
    .filter(|value| !value.is_empty())
    .cloned()
    .collect();

    if let Some(blob) = &self.blob_storage {
      for value in [&blob.secret_key, &blob.azure_account_key] {
        if !value.is_empty() {
          secrets.push(value.clone());
        }
      }
    }

    for material in &self.ci_project_details {
      if !material.git_options.password.is_empty() {
        secrets.push(material.git_options.password.clone());
      }
    }

    secrets.extend(self.secrets.iter().filter(|s| !s.is_empty()).cloned());

    secrets
  }
}
