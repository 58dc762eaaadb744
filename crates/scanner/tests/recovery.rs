use axum::{
  body::{to_bytes, Body},
  http::{Request, StatusCode},
};
use ci_runner::{Error, Result};
use ci_runner_scanner::{
  router, InMemoryRepository, MarkCompleted, RecoveryConfig, RecoveryManager, RecoveryMetrics,
  ScanExecution, ScanState, ScanTool, ScanToolExecutor,
};
use std::{
  path::Path,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};
use tokio::sync::{mpsc, Semaphore};
use tower::ServiceExt;

/// Tracks how many scans run at once.
#[derive(Default)]
struct Gauge {
  current: AtomicUsize,
  max: AtomicUsize,
}

#[async_trait::async_trait]
impl ScanToolExecutor for Gauge {
  async fn execute(&self, scan: &ScanExecution, _: Option<&ScanTool>, dir: &Path) -> Result<()> {
    assert!(dir.is_dir());
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.max.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(10)).await;
    self.current.fetch_sub(1, Ordering::SeqCst);

    if scan.execution_history_id % 5 == 0 {
      return Err(Error::scan_failed("tool crashed"));
    }
    Ok(())
  }
}

/// Blocks every scan until the test releases it.
struct Gate {
  started: mpsc::UnboundedSender<i64>,
  release: Semaphore,
}

#[async_trait::async_trait]
impl ScanToolExecutor for Gate {
  async fn execute(&self, scan: &ScanExecution, _: Option<&ScanTool>, _: &Path) -> Result<()> {
    let _ = self.started.send(scan.execution_history_id);
    self
      .release
      .acquire()
      .await
      .map_err(|err| Error::internal_runtime_error(err.to_string()))?
      .forget();
    Ok(())
  }
}

fn seeded(count: i64, try_count: u32) -> Arc<InMemoryRepository> {
  let repository = InMemoryRepository::new();
  for id in 1..=count {
    repository.insert(ScanExecution {
      execution_history_id: id,
      tool_id: 1,
      try_count,
      ..Default::default()
    });
  }
  Arc::new(repository)
}

fn config(root: &Path, batch_size: usize, max_workers: usize) -> RecoveryConfig {
  RecoveryConfig {
    batch_size,
    max_workers,
    batch_delay: Duration::from_millis(5),
    output_root: root.to_path_buf(),
    ..Default::default()
  }
}

#[ci_runner_test::test]
async fn recovery_bounds_concurrency_per_batch() {
  let dir = tempfile::tempdir().unwrap();
  let repository = seeded(25, 0);
  let gauge = Arc::new(Gauge::default());
  let manager = RecoveryManager::new(repository.clone(), gauge.clone(), config(dir.path(), 10, 3));

  let metrics = manager.run().await.unwrap();

  assert_eq!(metrics.total_pending, 25);
  assert_eq!(metrics.processed, 25);
  assert_eq!(metrics.recovered, 20);
  assert_eq!(metrics.failed, 5);
  assert!(!metrics.is_running);
  assert!(metrics.last_processed_time.is_some());
  assert!(gauge.max.load(Ordering::SeqCst) <= 3);

  assert_eq!(repository.count_in(ScanState::Completed), 20);
  // failed scans stay running for the next cycle
  assert_eq!(repository.count_in(ScanState::Running), 5);
  assert_eq!(repository.get((5, 1)).unwrap().try_count, 1);

  // every output directory is removed
  assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[ci_runner_test::test]
async fn exhausted_scans_are_marked_failed() {
  let dir = tempfile::tempdir().unwrap();
  let repository = seeded(2, 3);
  repository.insert(ScanExecution {
    execution_history_id: 9,
    tool_id: 1,
    try_count: 2,
    ..Default::default()
  });

  let manager = RecoveryManager::new(
    repository.clone(),
    Arc::new(MarkCompleted),
    config(dir.path(), 10, 3),
  );
  let metrics = manager.run().await.unwrap();

  assert_eq!(metrics.total_pending, 3);
  assert_eq!(metrics.processed, 1);
  assert_eq!(metrics.failed, 2);
  assert_eq!(repository.get((1, 1)).unwrap().state, ScanState::Failed);
  assert_eq!(repository.get((9, 1)).unwrap().state, ScanState::Completed);
  assert_eq!(repository.get((9, 1)).unwrap().try_count, 3);
}

#[ci_runner_test::test]
async fn stop_halts_before_the_next_scan() {
  let dir = tempfile::tempdir().unwrap();
  let (started, mut started_rx) = mpsc::unbounded_channel();
  let gate = Arc::new(Gate {
    started,
    release: Semaphore::new(0),
  });
  let manager = RecoveryManager::new(seeded(5, 0), gate.clone(), config(dir.path(), 10, 1));

  let handle = tokio::spawn({
    let manager = manager.clone();
    async move { manager.run().await }
  });

  assert_eq!(started_rx.recv().await, Some(1));
  assert!(manager.is_running());
  manager.stop();
  gate.release.add_permits(10);

  let metrics = handle.await.unwrap().unwrap();
  assert_eq!(metrics.processed, 1);
  assert_eq!(metrics.recovered, 1);
}

async fn body(response: axum::response::Response) -> String {
  let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
  String::from_utf8(bytes.to_vec()).unwrap()
}

#[ci_runner_test::test]
async fn status_and_metrics_routes() {
  let dir = tempfile::tempdir().unwrap();
  let manager = RecoveryManager::new(seeded(3, 0), Arc::new(MarkCompleted), config(dir.path(), 10, 3));
  manager.run().await.unwrap();

  let response = router(manager.clone())
    .oneshot(Request::builder().uri("/recovery/status").body(Body::empty()).unwrap())
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  let status: serde_json::Value = serde_json::from_str(&body(response).await).unwrap();
  assert_eq!(status["processed"], 3);
  assert_eq!(status["totalPending"], 3);
  assert_eq!(status["isRunning"], false);

  let response = router(manager)
    .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
    .await
    .unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  assert_eq!(
    response.headers()["content-type"],
    "text/plain; version=0.0.4"
  );
  assert!(body(response).await.contains("scan_recovery_recovered_total 3\n"));
}

#[ci_runner_test::test]
async fn start_conflicts_while_running() {
  let dir = tempfile::tempdir().unwrap();
  let (started, mut started_rx) = mpsc::unbounded_channel();
  let gate = Arc::new(Gate {
    started,
    release: Semaphore::new(0),
  });
  let manager = RecoveryManager::new(seeded(1, 0), gate.clone(), config(dir.path(), 10, 1));

  let post = |uri: &str| Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap();

  let response = router(manager.clone()).oneshot(post("/recovery/start")).await.unwrap();
  assert_eq!(response.status(), StatusCode::ACCEPTED);
  assert_eq!(started_rx.recv().await, Some(1));

  let response = router(manager.clone()).oneshot(post("/recovery/start")).await.unwrap();
  assert_eq!(response.status(), StatusCode::CONFLICT);

  let response = router(manager.clone()).oneshot(post("/recovery/stop")).await.unwrap();
  assert_eq!(response.status(), StatusCode::OK);
  gate.release.add_permits(1);

  for _ in 0..100 {
    if !manager.is_running() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  let metrics: RecoveryMetrics = manager.metrics();
  assert!(!metrics.is_running);
  assert_eq!(metrics.recovered, 1);
}
