use ci_runner::{Error, GitMaterial, GitSourceType, Result, StepObject};
use serde::Deserialize;
use std::path::Path;

pub const TASK_YAML_FILE: &str = ".ci-tasks.yaml";

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
  BranchFixed,
  TagPattern,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AppliesTo {
  #[serde(rename = "type")]
  pub trigger_type: TriggerType,
  #[serde(default)]
  pub value: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
  pub name: String,
  pub script: String,
  pub output_location: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
  pub applies_to: Vec<AppliesTo>,
  pub before_docker_build_stages: Vec<Task>,
  pub after_docker_build_stages: Vec<Task>,
}

/// Legacy per-repository task file.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskYaml {
  pub version: String,
  pub pipeline_conf: Vec<PipelineConfig>,
}

impl AppliesTo {
  fn matches(&self, material: &GitMaterial) -> bool {
    match self.trigger_type {
      TriggerType::BranchFixed => {
        material.source_type == GitSourceType::SourceTypeBranchFixed
          && self.value.iter().any(|branch| branch == &material.source_value)
      }
      TriggerType::TagPattern => self.value.iter().any(|pattern| match glob::Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(&material.source_value),
        Err(err) => {
          log::error!("Invalid tag pattern `{}`: {}", pattern, err);
          false
        }
      }),
    }
  }
}

impl TaskYaml {
  pub fn parse(content: &str) -> Result<Self> {
    serde_yaml::from_str(content)
      .map_err(|err| Error::bad_request(format!("Failed to parse {}: {}", TASK_YAML_FILE, err)))
  }

  /// Reads `<checkout>/.ci-tasks.yaml`, `None` when the file does not exist.
  pub async fn load(checkout_dir: &Path) -> Result<Option<Self>> {
    match tokio::fs::read_to_string(checkout_dir.join(TASK_YAML_FILE)).await {
      Ok(content) => Self::parse(&content).map(Some),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(err) => Err(err.into()),
    }
  }

  /// Before- and after-build tasks of every configuration that applies to
  /// `material`.
  pub fn matching_tasks(&self, material: &GitMaterial) -> (Vec<Task>, Vec<Task>) {
    let mut before = vec![];
    let mut after = vec![];

    for config in &self.pipeline_conf {
      if config.applies_to.iter().any(|applies| applies.matches(material)) {
        before.extend(config.before_docker_build_stages.iter().cloned());
        after.extend(config.after_docker_build_stages.iter().cloned());
      }
    }

    (before, after)
  }
}

/// Appends tasks as shell steps, continuing the step indices.
pub fn append_tasks(steps: &mut Vec<StepObject>, tasks: Vec<Task>) {
  let mut index = steps.iter().map(|step| step.index).max().unwrap_or(0);

  for task in tasks {
    index += 1;

    let artifact_paths = if task.output_location.is_empty() {
      vec![]
    } else {
      vec![task.output_location]
    };

    steps.push(StepObject {
      name: task.name,
      index,
      script: task.script,
      artifact_paths,
      ..Default::default()
    });
  }
}
