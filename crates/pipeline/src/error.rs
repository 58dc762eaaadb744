use ci_runner::CiMetrics;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Exit code of a failed CI stage.
pub const EXIT_CI_STAGE_FAILURE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
  Ci,
  Cd,
}

impl std::fmt::Display for WorkflowKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkflowKind::Ci => write!(f, "CI"),
      WorkflowKind::Cd => write!(f, "CD"),
    }
  }
}

/// A failed workflow with everything the completion event needs.
#[derive(thiserror::Error, Debug)]
#[error("{kind} stage failed: {failure_message}")]
pub struct StageError {
  pub kind: WorkflowKind,
  pub metrics: CiMetrics,
  pub failure_message: String,
  pub is_artifact_uploaded: bool,
  #[source]
  pub source: ci_runner::Error,
}

impl StageError {
  pub fn new(kind: WorkflowKind, source: ci_runner::Error) -> Self {
    StageError {
      kind,
      metrics: CiMetrics::default(),
      failure_message: source.to_string(),
      is_artifact_uploaded: false,
      source,
    }
  }

  pub fn with_metrics(mut self, metrics: CiMetrics) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn with_artifact_uploaded(mut self, uploaded: bool) -> Self {
    self.is_artifact_uploaded = uploaded;
    self
  }

  pub fn exit_code(&self) -> i32 {
    match self.kind {
      WorkflowKind::Ci => EXIT_CI_STAGE_FAILURE,
      WorkflowKind::Cd => EXIT_FAILURE,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_stage_error() {
    let err = StageError::new(WorkflowKind::Ci, ci_runner::Error::build_failed("oom"))
      .with_artifact_uploaded(true);

    assert_eq!(err.failure_message, "Build failed: oom");
    assert_eq!(err.to_string(), "CI stage failed: Build failed: oom");
    assert_eq!(err.exit_code(), EXIT_CI_STAGE_FAILURE);
    assert!(err.is_artifact_uploaded);
    assert_eq!(
      StageError::new(WorkflowKind::Cd, ci_runner::Error::bad_request("x")).exit_code(),
      EXIT_FAILURE
    );
  }
}
