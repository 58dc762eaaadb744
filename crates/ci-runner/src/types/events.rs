use crate::PluginArtifact;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall-clock bookkeeping of a CI run. Durations are seconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CiMetrics {
  pub cache_down_duration: f64,
  pub pre_ci_duration: f64,
  pub build_duration: f64,
  pub post_ci_duration: f64,
  pub cache_up_duration: f64,
  pub total_duration: f64,
  pub total_start_time: Option<DateTime<Utc>>,
  pub cache_down_start_time: Option<DateTime<Utc>>,
  pub pre_ci_start_time: Option<DateTime<Utc>>,
  pub build_start_time: Option<DateTime<Utc>>,
  pub post_ci_start_time: Option<DateTime<Utc>>,
  pub cache_up_start_time: Option<DateTime<Utc>>,
  pub total_end_time: Option<DateTime<Utc>>,
}

impl CiMetrics {
  pub fn start() -> Self {
    CiMetrics {
      total_start_time: Some(Utc::now()),
      ..Default::default()
    }
  }

  pub fn finish(&mut self) {
    let end = Utc::now();
    if let Some(start) = self.total_start_time {
      self.total_duration = seconds_between(start, end);
    }
    self.total_end_time = Some(end);
  }
}

pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
  (end - start)
    .to_std()
    .unwrap_or(Duration::ZERO)
    .as_secs_f64()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CiCompleteEvent {
  pub ci_project_details: Vec<crate::GitMaterial>,
  pub docker_image: String,
  pub digest: String,
  pub pipeline_id: i64,
  pub workflow_id: i64,
  pub triggered_by: i64,
  pub pipeline_name: String,
  pub data_source: String,
  pub material_type: String,
  pub metrics: CiMetrics,
  pub app_name: String,
  pub is_artifact_uploaded: bool,
  pub failure_reason: String,
  pub image_details_from_cr: Option<serde_json::Value>,
  pub plugin_artifacts: Vec<PluginArtifact>,
  pub target_platforms: Vec<String>,
  pub is_scan_enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CdCompleteEvent {
  pub workflow_id: i64,
  pub workflow_runner_id: i64,
  pub cd_pipeline_id: i64,
  pub triggered_by: i64,
  pub stage_type: String,
  pub is_artifact_uploaded: bool,
  pub failure_reason: String,
  pub plugin_artifacts: Vec<PluginArtifact>,
  pub is_virtual_execution: bool,
}

/// The payload emitted when a workflow finishes.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum CompletionEvent {
  Ci(CiCompleteEvent),
  Cd(CdCompleteEvent),
}

impl CompletionEvent {
  pub fn path(&self) -> &'static str {
    match self {
      CompletionEvent::Ci(_) => "/orchestrator/webhook/msg/ci",
      CompletionEvent::Cd(_) => "/orchestrator/webhook/msg/cd",
    }
  }

  pub fn is_failure(&self) -> bool {
    match self {
      CompletionEvent::Ci(event) => !event.failure_reason.is_empty(),
      CompletionEvent::Cd(event) => !event.failure_reason.is_empty(),
    }
  }
}
