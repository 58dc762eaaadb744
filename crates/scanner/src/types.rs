use chrono::{DateTime, Utc};
use ci_runner::StepObject;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
  #[default]
  Running,
  Completed,
  Failed,
}

/// The request a scan was started with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanEvent {
  pub image: String,
  pub image_digest: String,
  pub app_id: i64,
  pub env_id: i64,
  pub pipeline_id: i64,
  pub ci_artifact_id: i64,
  pub docker_registry_id: String,
}

/// Keyed by `(execution_history_id, tool_id)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanExecution {
  pub execution_history_id: i64,
  pub tool_id: i64,
  pub state: ScanState,
  pub try_count: u32,
  pub event: ScanEvent,
  pub started_on: Option<DateTime<Utc>>,
}

impl ScanExecution {
  pub fn key(&self) -> (i64, i64) {
    (self.execution_history_id, self.tool_id)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanTool {
  pub id: i64,
  pub name: String,
  pub version: String,
  pub steps: Vec<StepObject>,
}
