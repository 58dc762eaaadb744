use ci_runner::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
  fs::{File, OpenOptions},
  io::Write,
  path::Path,
  sync::Arc,
};

pub const MASK: &str = "********";

/// The workflow log: step output shown to the user and kept in the log
/// file that is uploaded with the artifacts.
#[derive(Clone, Default)]
pub struct WorkflowLogger {
  file: Option<Arc<Mutex<File>>>,
  secrets: Arc<RwLock<Vec<String>>>,
  /// Secrets that only apply to this handle
  scoped: Vec<String>,
}

impl WorkflowLogger {
  /// Logs to stdout only.
  pub fn stdout() -> Self {
    Self::default()
  }

  pub fn with_file(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    Ok(WorkflowLogger {
      file: Some(Arc::new(Mutex::new(file))),
      ..Default::default()
    })
  }

  pub fn register_secrets<I, S>(&self, secrets: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut registered = self.secrets.write();
    for secret in secrets {
      let secret = secret.into();
      if !secret.is_empty() && !registered.contains(&secret) {
        registered.push(secret);
      }
    }
    // Longest first so a secret containing another is masked whole
    registered.sort_by_key(|s| std::cmp::Reverse(s.len()));
  }

  /// A handle that additionally masks `secrets`.
  pub fn scoped(&self, secrets: &[String]) -> Self {
    let mut logger = self.clone();
    logger.scoped = secrets.iter().filter(|s| !s.is_empty()).cloned().collect();
    logger.scoped.sort_by_key(|s| std::cmp::Reverse(s.len()));
    logger
  }

  pub fn mask(&self, line: &str) -> String {
    let mut masked = line.to_string();

    for secret in self.scoped.iter().chain(self.secrets.read().iter()) {
      if masked.contains(secret.as_str()) {
        masked = masked.replace(secret.as_str(), MASK);
      }
    }

    masked
  }

  pub fn line(&self, line: &str) {
    let masked = self.mask(line);

    println!("{}", masked);

    if let Some(file) = &self.file {
      if let Err(err) = writeln!(file.lock(), "{}", masked) {
        log::warn!("Failed to write workflow log: {}", err);
      }
    }
  }

  pub fn stage_info(&self, info: &StageInfo) {
    match serde_json::to_string(info) {
      Ok(json) => self.line(&format!("STAGE_INFO|{}", json)),
      Err(err) => log::warn!("Failed to serialize stage info: {}", err),
    }
  }

  /// Emits the `Running` line and returns a handle that closes the stage.
  pub fn start_stage(&self, stage: impl Into<String>) -> StageLog {
    let info = StageInfo {
      stage: stage.into(),
      start_time: Utc::now(),
      end_time: None,
      status: StageStatus::Running,
    };
    self.stage_info(&info);

    StageLog {
      logger: self.clone(),
      info,
    }
  }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
  Running,
  Success,
  Failure,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageInfo {
  pub stage: String,
  pub start_time: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub end_time: Option<DateTime<Utc>>,
  pub status: StageStatus,
}

pub struct StageLog {
  logger: WorkflowLogger,
  info: StageInfo,
}

impl StageLog {
  pub fn finish(mut self, success: bool) {
    self.info.end_time = Some(Utc::now());
    self.info.status = if success {
      StageStatus::Success
    } else {
      StageStatus::Failure
    };
    self.logger.stage_info(&self.info);
  }

  /// Closes the stage according to `result` and hands it back.
  pub fn finish_with<T, E>(self, result: std::result::Result<T, E>) -> std::result::Result<T, E> {
    self.finish(result.is_ok());
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mask_longest_secret_first() {
    let logger = WorkflowLogger::stdout();
    logger.register_secrets(["abc", "abcdef", ""]);

    assert_eq!(logger.mask("token=abcdef;x=abc"), "token=********;x=********");

    let scoped = logger.scoped(&["xyz".to_string()]);
    assert_eq!(scoped.mask("xyz abc"), "******** ********");
    assert_eq!(logger.mask("xyz"), "xyz");
  }

  #[test]
  fn test_log_file_is_masked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("ci.log");

    let logger = WorkflowLogger::with_file(&path).unwrap();
    logger.register_secrets(["hunter2"]);
    logger.line("password is hunter2");

    let stage = logger.start_stage("DOCKER_BUILD");
    stage.finish(true);

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();

    assert_eq!(lines[0], "password is ********");
    assert!(lines[1].starts_with(r#"STAGE_INFO|{"stage":"DOCKER_BUILD","startTime":"#));
    assert!(lines[1].ends_with(r#""status":"Running"}"#));
    assert!(lines[2].contains(r#""endTime":"#));
    assert!(lines[2].ends_with(r#""status":"Success"}"#));
  }
}
