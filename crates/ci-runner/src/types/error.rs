#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("Bad request: {0}")]
  BadRequest(String),

  #[error("Runtime variable not found: {0}")]
  RuntimeVariableNotFound(String),

  #[error("Type coercion failed: {0}")]
  TypeCoercion(String),

  #[error("Invalid condition: {0}")]
  InvalidCondition(String),

  #[error("Undefined variable in condition: {0}")]
  UndefinedVariable(String),

  #[error("Unsupported operator: {0}")]
  UnsupportedOperator(String),

  #[error("Stage not successful, step `{0}` did not satisfy its success/failure conditions")]
  ConditionFailed(String),

  #[error("Step `{step}` panicked: {message}")]
  StepPanic { step: String, message: String },

  #[error("Ref plugin expansion exceeded the maximum depth of {0}")]
  RecursionLimit(usize),

  #[error("Command failed with exit code {exit_code:?}: {message}")]
  CommandFailed {
    exit_code: Option<i32>,
    message: String,
  },

  #[error("Build failed: {0}")]
  BuildFailed(String),

  #[error("Push failed: {0}")]
  PushFailed(String),

  #[error("Digest extraction failed: {0}")]
  DigestExtractFailed(String),

  #[error("Builder pod deleted: {0}")]
  BuilderPodDeleted(String),

  #[error("Image scan failed: {0}")]
  ScanFailed(String),

  #[error("Artifact upload failed: {0}")]
  ArtifactUploadFailed(String),

  #[error("Cache pull failed: {0}")]
  CachePullFailed(String),

  #[error("Error while running workflow: {0}")]
  InternalRuntimeError(String),

  #[error("IO error: {0}")]
  IOError(#[from] std::io::Error),
}

impl Error {
  pub fn bad_request<T: ToString>(message: T) -> Self {
    Self::BadRequest(message.to_string())
  }

  pub fn runtime_variable_not_found<T: ToString>(message: T) -> Self {
    Self::RuntimeVariableNotFound(message.to_string())
  }

  pub fn type_coercion<T: ToString>(message: T) -> Self {
    Self::TypeCoercion(message.to_string())
  }

  pub fn invalid_condition<T: ToString>(message: T) -> Self {
    Self::InvalidCondition(message.to_string())
  }

  pub fn undefined_variable<T: ToString>(name: T) -> Self {
    Self::UndefinedVariable(name.to_string())
  }

  pub fn unsupported_operator<T: ToString>(operator: T) -> Self {
    Self::UnsupportedOperator(operator.to_string())
  }

  pub fn condition_failed<T: ToString>(step: T) -> Self {
    Self::ConditionFailed(step.to_string())
  }

  pub fn step_panic<S: ToString, M: ToString>(step: S, message: M) -> Self {
    Self::StepPanic {
      step: step.to_string(),
      message: message.to_string(),
    }
  }

  pub fn recursion_limit(depth: usize) -> Self {
    Self::RecursionLimit(depth)
  }

  pub fn command_failed<T: ToString>(exit_code: Option<i32>, message: T) -> Self {
    Self::CommandFailed {
      exit_code,
      message: message.to_string(),
    }
  }

  pub fn build_failed<T: ToString>(message: T) -> Self {
    Self::BuildFailed(message.to_string())
  }

  pub fn push_failed<T: ToString>(message: T) -> Self {
    Self::PushFailed(message.to_string())
  }

  pub fn digest_extract_failed<T: ToString>(message: T) -> Self {
    Self::DigestExtractFailed(message.to_string())
  }

  pub fn builder_pod_deleted<T: ToString>(message: T) -> Self {
    Self::BuilderPodDeleted(message.to_string())
  }

  pub fn scan_failed<T: ToString>(message: T) -> Self {
    Self::ScanFailed(message.to_string())
  }

  pub fn artifact_upload_failed<T: ToString>(message: T) -> Self {
    Self::ArtifactUploadFailed(message.to_string())
  }

  pub fn cache_pull_failed<T: ToString>(message: T) -> Self {
    Self::CachePullFailed(message.to_string())
  }

  pub fn internal_runtime_error<T: ToString>(message: T) -> Self {
    Self::InternalRuntimeError(message.to_string())
  }

  pub fn io_error(source: std::io::Error) -> Self {
    Self::IOError(source)
  }

  pub fn is_builder_pod_deleted(&self) -> bool {
    matches!(self, Self::BuilderPodDeleted(_))
  }

  pub fn is_condition_failed(&self) -> bool {
    matches!(self, Self::ConditionFailed(_))
  }
}

// Compared by kind and message so tests can assert on returned errors
impl PartialEq for Error {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::BadRequest(a), Self::BadRequest(b)) => a == b,
      (Self::RuntimeVariableNotFound(a), Self::RuntimeVariableNotFound(b)) => a == b,
      (Self::TypeCoercion(a), Self::TypeCoercion(b)) => a == b,
      (Self::InvalidCondition(a), Self::InvalidCondition(b)) => a == b,
      (Self::UndefinedVariable(a), Self::UndefinedVariable(b)) => a == b,
      (Self::UnsupportedOperator(a), Self::UnsupportedOperator(b)) => a == b,
      (Self::ConditionFailed(a), Self::ConditionFailed(b)) => a == b,
      (
        Self::StepPanic {
          step: a,
          message: m1,
        },
        Self::StepPanic {
          step: b,
          message: m2,
        },
      ) => a == b && m1 == m2,
      (Self::RecursionLimit(a), Self::RecursionLimit(b)) => a == b,
      (
        Self::CommandFailed {
          exit_code: c1,
          message: m1,
        },
        Self::CommandFailed {
          exit_code: c2,
          message: m2,
        },
      ) => c1 == c2 && m1 == m2,
      (Self::BuildFailed(a), Self::BuildFailed(b)) => a == b,
      (Self::PushFailed(a), Self::PushFailed(b)) => a == b,
      (Self::DigestExtractFailed(a), Self::DigestExtractFailed(b)) => a == b,
      (Self::BuilderPodDeleted(a), Self::BuilderPodDeleted(b)) => a == b,
      (Self::ScanFailed(a), Self::ScanFailed(b)) => a == b,
      (Self::ArtifactUploadFailed(a), Self::ArtifactUploadFailed(b)) => a == b,
      (Self::CachePullFailed(a), Self::CachePullFailed(b)) => a == b,
      (Self::InternalRuntimeError(a), Self::InternalRuntimeError(b)) => a == b,
      (Self::IOError(a), Self::IOError(b)) => a.kind() == b.kind(),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_eq() {
    assert_eq!(Error::bad_request("hello"), Error::bad_request("hello"));
    assert_eq!(
      Error::runtime_variable_not_found("x"),
      Error::runtime_variable_not_found("x")
    );
    assert_eq!(Error::step_panic("s", "boom"), Error::step_panic("s", "boom"));
    assert_eq!(
      Error::command_failed(Some(1), "exit"),
      Error::command_failed(Some(1), "exit")
    );
    assert_eq!(
      Error::io_error(std::io::Error::new(std::io::ErrorKind::Other, "hello")),
      Error::io_error(std::io::Error::new(std::io::ErrorKind::Other, "world"))
    );
  }

  #[test]
  fn test_ne() {
    assert_ne!(Error::bad_request("hello"), Error::bad_request("world"));
    assert_ne!(Error::type_coercion("x"), Error::bad_request("x"));
    assert_ne!(
      Error::command_failed(Some(1), "exit"),
      Error::command_failed(Some(2), "exit")
    );
    assert_ne!(Error::recursion_limit(8), Error::recursion_limit(9));
  }

  #[test]
  fn test_display() {
    assert_eq!(
      Error::condition_failed("lint").to_string(),
      "Stage not successful, step `lint` did not satisfy its success/failure conditions"
    );
    assert_eq!(
      Error::step_panic("build", "index out of bounds").to_string(),
      "Step `build` panicked: index out of bounds"
    );
    assert!(Error::builder_pod_deleted("pod gone").is_builder_pod_deleted());
    assert!(!Error::build_failed("oops").is_builder_pod_deleted());
  }
}
