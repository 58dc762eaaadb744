use crate::{ConditionObject, Error, Result, VariableObject};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
  #[default]
  Inline,
  RefPlugin,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorType {
  #[default]
  Shell,
  ContainerImage,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MountPath {
  pub src_path: String,
  pub dest_path: String,
}

impl MountPath {
  pub fn new(src_path: impl Into<String>, dest_path: impl Into<String>) -> Self {
    MountPath {
      src_path: src_path.into(),
      dest_path: dest_path.into(),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StepObject {
  pub name: String,
  /// 1-based ordinal inside the containing list, keys output variables
  pub index: usize,
  pub step_type: StepType,
  pub executor_type: ExecutorType,
  pub ref_plugin_id: Option<i64>,
  pub script: String,
  pub input_vars: Vec<VariableObject>,
  pub output_vars: Vec<VariableObject>,
  pub trigger_skip_conditions: Vec<ConditionObject>,
  pub success_failure_conditions: Vec<ConditionObject>,
  pub docker_image: String,
  pub command: String,
  pub args: Vec<String>,
  /// host port -> container port
  pub exposed_ports: BTreeMap<u16, u16>,
  pub custom_script_mount: Option<MountPath>,
  pub source_code_mount: Option<MountPath>,
  pub extra_volume_mounts: Vec<MountPath>,
  pub artifact_paths: Vec<String>,
  pub trigger_if_parent_stage_fail: bool,
}

/// What a step executes, decided once from `stepType` and `executorType`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind<'a> {
  Shell {
    script: &'a str,
  },
  Container {
    image: &'a str,
    command: &'a str,
    args: &'a [String],
    script: &'a str,
  },
  RefPlugin {
    plugin_id: i64,
  },
}

impl StepObject {
  pub fn kind(&self) -> Result<StepKind<'_>> {
    match (self.step_type, self.executor_type) {
      (StepType::RefPlugin, _) => {
        let plugin_id = self.ref_plugin_id.ok_or_else(|| {
          Error::bad_request(format!("step `{}` has no refPluginId", self.name))
        })?;

        Ok(StepKind::RefPlugin { plugin_id })
      }
      (StepType::Inline, ExecutorType::Shell) => Ok(StepKind::Shell {
        script: &self.script,
      }),
      (StepType::Inline, ExecutorType::ContainerImage) => {
        if self.docker_image.is_empty() {
          return Err(Error::bad_request(format!(
            "container step `{}` has no docker image",
            self.name
          )));
        }

        Ok(StepKind::Container {
          image: &self.docker_image,
          command: &self.command,
          args: &self.args,
          script: &self.script,
        })
      }
    }
  }

  /// Human readable name used for logs and errors.
  pub fn display_name(&self) -> String {
    if self.name.is_empty() {
      format!("step-{}", self.index)
    } else {
      self.name.clone()
    }
  }

  /// File-system friendly name used for script files and container names.
  pub fn script_name(&self) -> String {
    let sanitized: String = self
      .display_name()
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
      .collect();

    format!("{}_{}", self.index, sanitized)
  }

  pub fn output_var_names(&self) -> Vec<String> {
    self.output_vars.iter().map(|v| v.name.clone()).collect()
  }

  /// Post steps allowed to run after the build stage failed.
  pub fn filter_trigger_if_parent_stage_fail(steps: &[StepObject]) -> Vec<StepObject> {
    steps
      .iter()
      .filter(|step| step.trigger_if_parent_stage_fail)
      .cloned()
      .collect()
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RefPluginObject {
  pub id: i64,
  pub steps: Vec<StepObject>,
}

pub type RefPluginMap = HashMap<i64, Vec<StepObject>>;

pub fn ref_plugin_map(plugins: &[RefPluginObject]) -> RefPluginMap {
  plugins
    .iter()
    .map(|plugin| (plugin.id, plugin.steps.clone()))
    .collect()
}
