use crate::{ScanExecution, ScanState, ScanTool};
use ci_runner::{Error, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Persistence of scan executions.
#[async_trait::async_trait]
pub trait ScanExecutionRepository: Send + Sync {
  /// Every scan still in `Running`.
  async fn running_scans(&self) -> Result<Vec<ScanExecution>>;

  async fn tool(&self, tool_id: i64) -> Result<Option<ScanTool>>;

  /// Moves a running scan to `state`. Scans that already left `Running` are
  /// not touched.
  async fn update_state(&self, key: (i64, i64), state: ScanState) -> Result<()>;

  /// Records another attempt and returns the new count.
  async fn increment_try_count(&self, key: (i64, i64)) -> Result<u32>;
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct Seed {
  scans: Vec<ScanExecution>,
  tools: Vec<ScanTool>,
}

#[derive(Default)]
pub struct InMemoryRepository {
  scans: Mutex<BTreeMap<(i64, i64), ScanExecution>>,
  tools: Mutex<HashMap<i64, ScanTool>>,
}

impl InMemoryRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// Loads `{"scans": [...], "tools": [...]}`.
  pub fn from_json(json: &str) -> Result<Self> {
    let seed: Seed = serde_json::from_str(json)
      .map_err(|err| Error::bad_request(format!("invalid scan seed: {}", err)))?;

    let repository = Self::new();
    for scan in seed.scans {
      repository.insert(scan);
    }
    for tool in seed.tools {
      repository.insert_tool(tool);
    }

    Ok(repository)
  }

  pub fn insert(&self, scan: ScanExecution) {
    self.scans.lock().insert(scan.key(), scan);
  }

  pub fn insert_tool(&self, tool: ScanTool) {
    self.tools.lock().insert(tool.id, tool);
  }

  pub fn get(&self, key: (i64, i64)) -> Option<ScanExecution> {
    self.scans.lock().get(&key).cloned()
  }

  pub fn count_in(&self, state: ScanState) -> usize {
    self
      .scans
      .lock()
      .values()
      .filter(|scan| scan.state == state)
      .count()
  }
}

#[async_trait::async_trait]
impl ScanExecutionRepository for InMemoryRepository {
  async fn running_scans(&self) -> Result<Vec<ScanExecution>> {
    Ok(
      self
        .scans
        .lock()
        .values()
        .filter(|scan| scan.state == ScanState::Running)
        .cloned()
        .collect(),
    )
  }

  async fn tool(&self, tool_id: i64) -> Result<Option<ScanTool>> {
    Ok(self.tools.lock().get(&tool_id).cloned())
  }

  async fn update_state(&self, key: (i64, i64), state: ScanState) -> Result<()> {
    let mut scans = self.scans.lock();
    let scan = scans
      .get_mut(&key)
      .ok_or_else(|| Error::bad_request(format!("unknown scan {:?}", key)))?;

    if scan.state == ScanState::Running {
      scan.state = state;
    } else {
      log::debug!("Scan {:?} is already {:?}", key, scan.state);
    }

    Ok(())
  }

  async fn increment_try_count(&self, key: (i64, i64)) -> Result<u32> {
    let mut scans = self.scans.lock();
    let scan = scans
      .get_mut(&key)
      .ok_or_else(|| Error::bad_request(format!("unknown scan {:?}", key)))?;

    scan.try_count += 1;

    Ok(scan.try_count)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[ci_runner_test::test]
  async fn test_state_transitions_are_one_way() {
    let repository = InMemoryRepository::from_json(
      r#"{"scans":[{"executionHistoryId":1,"toolId":2,"state":"RUNNING"}],"tools":[{"id":2,"name":"trivy"}]}"#,
    )
    .unwrap();

    assert_eq!(repository.running_scans().await.unwrap().len(), 1);
    assert_eq!(repository.tool(2).await.unwrap().unwrap().name, "trivy");

    repository.update_state((1, 2), ScanState::Completed).await.unwrap();
    repository.update_state((1, 2), ScanState::Failed).await.unwrap();

    assert_eq!(repository.get((1, 2)).unwrap().state, ScanState::Completed);
    assert!(repository.running_scans().await.unwrap().is_empty());
  }

  #[ci_runner_test::test]
  async fn test_unknown_scan() {
    let repository = InMemoryRepository::new();
    assert!(matches!(
      repository.increment_try_count((9, 9)).await,
      Err(Error::BadRequest(_))
    ));
  }
}
