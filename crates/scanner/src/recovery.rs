use crate::{ScanExecution, ScanExecutionRepository, ScanState, ScanToolExecutor};
use chrono::{DateTime, Utc};
use ci_runner::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};
use tokio::{sync::Semaphore, task::JoinSet};

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
  pub start_delay: Duration,
  pub batch_size: usize,
  pub max_workers: usize,
  pub batch_delay: Duration,
  /// Scans that already had this many attempts are marked failed
  pub scan_try_count: u32,
  /// Per-scan output directories are created under here
  pub output_root: PathBuf,
}

impl Default for RecoveryConfig {
  fn default() -> Self {
    RecoveryConfig {
      start_delay: Duration::ZERO,
      batch_size: 10,
      max_workers: 3,
      batch_delay: Duration::from_secs(1),
      scan_try_count: 3,
      output_root: PathBuf::from("/tmp/scan-recovery"),
    }
  }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMetrics {
  pub total_pending: usize,
  pub processed: usize,
  pub recovered: usize,
  pub failed: usize,
  pub start_time: Option<DateTime<Utc>>,
  pub last_processed_time: Option<DateTime<Utc>>,
  pub is_running: bool,
}

struct Inner {
  repository: Arc<dyn ScanExecutionRepository>,
  executor: Arc<dyn ScanToolExecutor>,
  config: RecoveryConfig,
  metrics: Mutex<RecoveryMetrics>,
  running: AtomicBool,
  stopped: AtomicBool,
}

/// Resumes scans left in `Running` after a restart, batch by batch with a
/// bounded number of scans in flight.
#[derive(Clone)]
pub struct RecoveryManager {
  inner: Arc<Inner>,
}

impl RecoveryManager {
  pub fn new(
    repository: Arc<dyn ScanExecutionRepository>,
    executor: Arc<dyn ScanToolExecutor>,
    config: RecoveryConfig,
  ) -> Self {
    RecoveryManager {
      inner: Arc::new(Inner {
        repository,
        executor,
        config,
        metrics: Mutex::new(RecoveryMetrics::default()),
        running: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
      }),
    }
  }

  pub fn metrics(&self) -> RecoveryMetrics {
    self.inner.metrics.lock().clone()
  }

  pub fn is_running(&self) -> bool {
    self.inner.running.load(Ordering::SeqCst)
  }

  /// Asks a running cycle to stop. Scans already in flight finish.
  pub fn stop(&self) {
    if self.is_running() {
      log::info!("Stopping scan recovery");
    }
    self.inner.stopped.store(true, Ordering::SeqCst);
  }

  fn is_stopped(&self) -> bool {
    self.inner.stopped.load(Ordering::SeqCst)
  }

  /// Runs a cycle in the background. Returns `false` if one is already
  /// running.
  pub fn start(&self) -> bool {
    if !self.claim() {
      return false;
    }

    let manager = self.clone();
    tokio::spawn(async move {
      match manager.run_claimed().await {
        Ok(metrics) => log::info!(
          "Scan recovery finished: {} recovered, {} failed",
          metrics.recovered,
          metrics.failed
        ),
        Err(err) => log::error!("Scan recovery failed: {}", err),
      }
    });

    true
  }

  /// Runs one recovery cycle to completion.
  pub async fn run(&self) -> Result<RecoveryMetrics> {
    if !self.claim() {
      return Err(Error::bad_request("scan recovery is already running"));
    }

    self.run_claimed().await
  }

  fn claim(&self) -> bool {
    let claimed = self
      .inner
      .running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok();

    if claimed {
      self.inner.stopped.store(false, Ordering::SeqCst);
    }

    claimed
  }

  async fn run_claimed(&self) -> Result<RecoveryMetrics> {
    *self.inner.metrics.lock() = RecoveryMetrics {
      start_time: Some(Utc::now()),
      is_running: true,
      ..Default::default()
    };

    let result = self.run_cycle().await;

    self.inner.metrics.lock().is_running = false;
    self.inner.running.store(false, Ordering::SeqCst);

    result.map(|_| self.metrics())
  }

  async fn run_cycle(&self) -> Result<()> {
    let config = &self.inner.config;

    if !config.start_delay.is_zero() {
      log::info!(
        "Scan recovery starts in {}s",
        config.start_delay.as_secs_f64()
      );
      tokio::time::sleep(config.start_delay).await;
    }

    let scans = self.inner.repository.running_scans().await?;
    self.inner.metrics.lock().total_pending = scans.len();
    log::info!("Found {} interrupted scans", scans.len());

    let mut pending = Vec::with_capacity(scans.len());
    for scan in scans {
      if scan.try_count >= config.scan_try_count {
        log::warn!(
          "Scan {}/{} gave up after {} attempts",
          scan.execution_history_id,
          scan.tool_id,
          scan.try_count
        );
        self
          .inner
          .repository
          .update_state(scan.key(), ScanState::Failed)
          .await?;
        self.inner.metrics.lock().failed += 1;
      } else {
        pending.push(scan);
      }
    }

    let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));

    for (index, batch) in pending.chunks(config.batch_size.max(1)).enumerate() {
      if self.is_stopped() {
        break;
      }

      if index > 0 && !config.batch_delay.is_zero() {
        tokio::time::sleep(config.batch_delay).await;
      }

      log::debug!("Recovering batch {} of {} scans", index + 1, batch.len());

      let mut tasks = JoinSet::new();
      for scan in batch {
        if self.is_stopped() {
          break;
        }

        let permit = semaphore
          .clone()
          .acquire_owned()
          .await
          .map_err(|err| Error::internal_runtime_error(err.to_string()))?;

        if self.is_stopped() {
          break;
        }

        let manager = self.clone();
        let scan = scan.clone();
        tasks.spawn(async move {
          manager.recover(scan).await;
          drop(permit);
        });
      }

      while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
          log::error!("Scan recovery task failed: {}", err);
        }
      }
    }

    Ok(())
  }

  async fn recover(&self, scan: ScanExecution) {
    let (history_id, tool_id) = scan.key();
    let output_dir = self
      .inner
      .config
      .output_root
      .join(format!("{}-{}", history_id, tool_id));

    let result = self.recover_in(&scan, &output_dir).await;

    match tokio::fs::remove_dir_all(&output_dir).await {
      Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
        log::warn!("Failed to remove {}: {}", output_dir.display(), err)
      }
      _ => {}
    }

    let mut metrics = self.inner.metrics.lock();
    metrics.processed += 1;
    metrics.last_processed_time = Some(Utc::now());

    match result {
      Ok(()) => {
        log::info!("Recovered scan {}/{}", history_id, tool_id);
        metrics.recovered += 1;
      }
      Err(err) => {
        log::warn!("Scan {}/{} stays running: {}", history_id, tool_id, err);
        metrics.failed += 1;
      }
    }
  }

  async fn recover_in(&self, scan: &ScanExecution, output_dir: &Path) -> Result<()> {
    let repository = &self.inner.repository;

    tokio::fs::create_dir_all(output_dir).await?;
    repository.increment_try_count(scan.key()).await?;

    let tool = repository.tool(scan.tool_id).await?;
    self
      .inner
      .executor
      .execute(scan, tool.as_ref(), output_dir)
      .await?;

    repository
      .update_state(scan.key(), ScanState::Completed)
      .await
  }
}
