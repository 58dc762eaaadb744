use crate::{ScanExecution, ScanTool};
use ci_runner::{
  EnvironmentVariables, Error, RefPluginMap, Result, ScriptRunner, StageConfig, StageExecutor,
  StageKind, VariableEnvironment,
};
use std::{path::Path, sync::Arc, time::Duration};

/// Re-dispatches an interrupted scan.
#[async_trait::async_trait]
pub trait ScanToolExecutor: Send + Sync {
  async fn execute(
    &self,
    scan: &ScanExecution,
    tool: Option<&ScanTool>,
    output_dir: &Path,
  ) -> Result<()>;
}

/// Accepts every scan as is. Recovered scans are marked completed without
/// running their tool again.
pub struct MarkCompleted;

#[async_trait::async_trait]
impl ScanToolExecutor for MarkCompleted {
  async fn execute(&self, scan: &ScanExecution, _: Option<&ScanTool>, _: &Path) -> Result<()> {
    log::debug!(
      "Accepting scan {}/{} without re-execution",
      scan.execution_history_id,
      scan.tool_id
    );
    Ok(())
  }
}

/// Runs the tool's step list as a `SCANNING` stage inside the scan's output
/// directory.
pub struct StageToolExecutor {
  runner: Arc<dyn ScriptRunner>,
  timeout: Duration,
}

impl StageToolExecutor {
  pub fn new(runner: Arc<dyn ScriptRunner>, timeout: Duration) -> Self {
    StageToolExecutor { runner, timeout }
  }

  fn system_env(scan: &ScanExecution, output_dir: &Path) -> EnvironmentVariables {
    let event = &scan.event;
    let mut env = EnvironmentVariables::new();

    env.insert("IMAGE_TO_SCAN".to_string(), event.image.clone());
    env.insert("IMAGE_DIGEST".to_string(), event.image_digest.clone());
    env.insert("APP_ID".to_string(), event.app_id.to_string());
    env.insert("ENV_ID".to_string(), event.env_id.to_string());
    env.insert("PIPELINE_ID".to_string(), event.pipeline_id.to_string());
    env.insert("CI_ARTIFACT_ID".to_string(), event.ci_artifact_id.to_string());
    env.insert(
      "DOCKER_REGISTRY_ID".to_string(),
      event.docker_registry_id.clone(),
    );
    env.insert(
      "EXECUTION_HISTORY_ID".to_string(),
      scan.execution_history_id.to_string(),
    );
    env.insert(
      "OUTPUT_DIRECTORY".to_string(),
      output_dir.to_string_lossy().to_string(),
    );

    env
  }
}

#[async_trait::async_trait]
impl ScanToolExecutor for StageToolExecutor {
  async fn execute(
    &self,
    scan: &ScanExecution,
    tool: Option<&ScanTool>,
    output_dir: &Path,
  ) -> Result<()> {
    let tool = tool.ok_or_else(|| {
      Error::scan_failed(format!("scan tool {} is not registered", scan.tool_id))
    })?;

    log::info!(
      "Re-executing {} {} for scan {}",
      tool.name,
      tool.version,
      scan.execution_history_id
    );

    let executor = StageExecutor::new(
      self.runner.clone(),
      StageConfig::new(output_dir.join("process")),
    );
    let mut env = VariableEnvironment::new(
      Self::system_env(scan, output_dir),
      EnvironmentVariables::new(),
    );

    let run = executor.run_steps(
      StageKind::Scanning,
      &tool.steps,
      Arc::new(RefPluginMap::new()),
      &mut env,
      None,
      true,
    );

    let result = tokio::time::timeout(self.timeout, run)
      .await
      .map_err(|_| {
        Error::scan_failed(format!(
          "{} timed out after {}s",
          tool.name,
          self.timeout.as_secs()
        ))
      })?;

    match result.error {
      Some(err) => Err(Error::scan_failed(err.to_string())),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ScanEvent;
  use ci_runner::{ScriptOutputs, ScriptRequest, StepObject};
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[derive(Default)]
  struct Recorder {
    requests: Mutex<Vec<ScriptRequest>>,
    slow_finished: AtomicBool,
  }

  #[async_trait::async_trait]
  impl ScriptRunner for Recorder {
    async fn run(&self, request: ScriptRequest) -> Result<ScriptOutputs> {
      let slow = request.script_name.contains("slow");
      self.requests.lock().push(request);
      if slow {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.slow_finished.store(true, Ordering::SeqCst);
      }
      Ok(ScriptOutputs::new())
    }
  }

  fn scan() -> ScanExecution {
    ScanExecution {
      execution_history_id: 7,
      tool_id: 1,
      event: ScanEvent {
        image: "reg.io/app:1".to_string(),
        ..Default::default()
      },
      ..Default::default()
    }
  }

  fn tool(step_name: &str) -> ScanTool {
    ScanTool {
      id: 1,
      name: "trivy".to_string(),
      steps: vec![StepObject {
        name: step_name.to_string(),
        index: 1,
        script: "trivy image $IMAGE_TO_SCAN".to_string(),
        ..Default::default()
      }],
      ..Default::default()
    }
  }

  #[ci_runner_test::test]
  async fn test_tool_steps_see_the_scan_image() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(Recorder::default());
    let executor = StageToolExecutor::new(runner.clone(), Duration::from_secs(5));

    executor
      .execute(&scan(), Some(&tool("scan")), dir.path())
      .await
      .unwrap();

    let requests = runner.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].env.get("IMAGE_TO_SCAN").unwrap(), "reg.io/app:1");
  }

  #[ci_runner_test::test]
  async fn test_missing_tool_fails() {
    let dir = tempfile::tempdir().unwrap();
    let executor = StageToolExecutor::new(Arc::new(Recorder::default()), Duration::from_secs(5));

    let err = executor.execute(&scan(), None, dir.path()).await.unwrap_err();
    assert!(matches!(err, Error::ScanFailed(_)));
  }

  #[ci_runner_test::test]
  async fn test_scan_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(Recorder::default());
    let executor = StageToolExecutor::new(runner.clone(), Duration::from_millis(50));

    let err = executor
      .execute(&scan(), Some(&tool("slow")), dir.path())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ScanFailed(_)));

    // The timed out step must not keep running in the background.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!runner.slow_finished.load(Ordering::SeqCst));
  }
}
