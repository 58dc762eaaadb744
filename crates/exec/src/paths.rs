use ci_runner::{Error, Result};
use std::path::{Component, Path, PathBuf};

pub trait PathTryToString {
  fn try_to_string(&self) -> Result<String>;
}

impl PathTryToString for Path {
  fn try_to_string(&self) -> Result<String> {
    self
      .to_str()
      .map(|s| s.to_string())
      .ok_or_else(|| Error::internal_runtime_error(format!("{:?} is not valid UTF-8", self)))
  }
}

/// Where a step keeps its files, on the host and inside a container.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPaths {
  pub work_dir: PathBuf,
  /// `<work_dir>/<script_name>.sh`
  pub script_path: PathBuf,
  /// `<work_dir>/out.env`, written by shell steps
  pub out_env_path: PathBuf,
  /// `<work_dir>/output`, mounted at `/output` in containers
  pub output_dir: PathBuf,
  /// `<work_dir>/files`, contents of `FILE` variables
  pub files_dir: PathBuf,
  /// `<work_dir>/opt/<script_name>`, container artifact mounts
  pub container_artifacts_dir: PathBuf,
  /// `<staging>/<script_name>`
  pub artifact_target_dir: PathBuf,
  pub container_name: String,
}

impl StepPaths {
  pub const CONTAINER_OUTPUT_DIR: &'static str = "/output";
  pub const CONTAINER_SCRIPT_DIR: &'static str = "/ci-runner/scripts";

  pub fn builder() -> StepPathsBuilder {
    StepPathsBuilder::default()
  }

  /// `out.env` as seen from the host for a container step.
  pub fn container_out_env_path(&self) -> PathBuf {
    self.output_dir.join("out.env")
  }

  pub fn container_script_path(&self, script_name: &str) -> String {
    format!("{}/{}.sh", Self::CONTAINER_SCRIPT_DIR, script_name)
  }

  /// File variables are written directly into `files_dir`; a name must be a
  /// single plain path component.
  pub fn file_variable_path(&self, name: &str) -> Result<PathBuf> {
    let mut components = Path::new(name).components();

    match (components.next(), components.next()) {
      (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => {
        Ok(self.files_dir.join(name))
      }
      _ => Err(Error::bad_request(format!(
        "invalid file variable name {:?}",
        name
      ))),
    }
  }
}

#[derive(Default)]
pub struct StepPathsBuilder {
  work_dir: Option<PathBuf>,
  script_name: Option<String>,
  artifact_staging_dir: Option<PathBuf>,
}

impl StepPathsBuilder {
  pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
    self.work_dir = Some(work_dir.into());
    self
  }

  pub fn script_name(mut self, script_name: impl Into<String>) -> Self {
    self.script_name = Some(script_name.into());
    self
  }

  pub fn artifact_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.artifact_staging_dir = Some(dir.into());
    self
  }

  pub fn build(self) -> Result<StepPaths> {
    let work_dir = self
      .work_dir
      .ok_or_else(|| Error::internal_runtime_error("step work dir is not set"))?;
    let script_name = self
      .script_name
      .ok_or_else(|| Error::internal_runtime_error("step script name is not set"))?;
    let staging = self
      .artifact_staging_dir
      .unwrap_or_else(|| work_dir.join("artifacts"));

    Ok(StepPaths {
      script_path: work_dir.join(format!("{}.sh", script_name)),
      out_env_path: work_dir.join("out.env"),
      output_dir: work_dir.join("output"),
      files_dir: work_dir.join("files"),
      container_artifacts_dir: work_dir.join("opt").join(&script_name),
      artifact_target_dir: staging.join(&script_name),
      container_name: format!("ci-step-{}", crate::utils::container_name(&script_name)),
      work_dir,
    })
  }
}
