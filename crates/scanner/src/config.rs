use crate::RecoveryConfig;
use clap::{ArgAction, Parser};
use std::{path::PathBuf, time::Duration};

/// Resumes interrupted image scans and reports on them over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-scanner", version, about)]
pub struct ScannerArgs {
  #[arg(long, env = "SERVER_HTTP_PORT", default_value_t = 8080)]
  pub port: u16,

  /// Seconds in-flight requests get after a shutdown signal
  #[arg(long, env = "SERVER_SHUTDOWN_TIMEOUT", default_value_t = 5)]
  pub shutdown_timeout: u64,

  #[arg(long, env = "RECOVERY_START_DELAY_SECONDS", default_value_t = 0)]
  pub recovery_start_delay: u64,

  #[arg(long, env = "RECOVERY_BATCH_SIZE", default_value_t = 10)]
  pub recovery_batch_size: usize,

  #[arg(long, env = "RECOVERY_MAX_WORKERS", default_value_t = 3)]
  pub recovery_max_workers: usize,

  #[arg(long, env = "RECOVERY_BATCH_DELAY_SECONDS", default_value_t = 1)]
  pub recovery_batch_delay: u64,

  #[arg(long, env = "SCAN_TRY_COUNT", default_value_t = 3)]
  pub scan_try_count: u32,

  /// Runs the tool's steps again instead of accepting the scan
  #[arg(long, env = "RECOVERY_REEXECUTE_TOOL_STEPS", default_value_t = false, action = ArgAction::Set)]
  pub reexecute_tool_steps: bool,

  #[arg(long, env = "RECOVERY_ENABLED", default_value_t = true, action = ArgAction::Set)]
  pub recovery_enabled: bool,

  #[arg(long, env = "SCAN_OUTPUT_ROOT", default_value = "/tmp/scan-recovery")]
  pub scan_output_root: PathBuf,

  /// Minutes a re-executed scan may take
  #[arg(long, env = "SCAN_IMAGE_TIMEOUT", default_value_t = 10)]
  pub scan_image_timeout: u64,

  /// JSON seed of scan executions and tools
  #[arg(long, env = "SCAN_EXECUTIONS_FILE")]
  pub scan_executions_file: Option<PathBuf>,

  #[arg(long, env = "LOG_LEVEL", default_value = "info")]
  pub log_level: String,
}

impl ScannerArgs {
  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout)
  }

  pub fn scan_timeout(&self) -> Duration {
    Duration::from_secs(self.scan_image_timeout * 60)
  }
}

impl From<&ScannerArgs> for RecoveryConfig {
  fn from(args: &ScannerArgs) -> Self {
    RecoveryConfig {
      start_delay: Duration::from_secs(args.recovery_start_delay),
      batch_size: args.recovery_batch_size,
      max_workers: args.recovery_max_workers,
      batch_delay: Duration::from_secs(args.recovery_batch_delay),
      scan_try_count: args.scan_try_count,
      output_root: args.scan_output_root.clone(),
    }
  }
}
