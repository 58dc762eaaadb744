use anyhow::Context;
use ci_runner_exec::{StepExecutor, WorkflowLogger};
use ci_runner_scanner::{
  serve, shutdown_signal, InMemoryRepository, MarkCompleted, RecoveryConfig, RecoveryManager,
  ScanToolExecutor, ScannerArgs, StageToolExecutor,
};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;

async fn run(args: ScannerArgs) -> anyhow::Result<()> {
  let repository = match &args.scan_executions_file {
    Some(path) => {
      let seed = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
      InMemoryRepository::from_json(&seed)?
    }
    None => InMemoryRepository::new(),
  };

  let config = RecoveryConfig::from(&args);
  let executor: Arc<dyn ScanToolExecutor> = if args.reexecute_tool_steps {
    let steps = StepExecutor::new(
      config.output_root.join("artifacts"),
      WorkflowLogger::stdout(),
    );
    Arc::new(StageToolExecutor::new(Arc::new(steps), args.scan_timeout()))
  } else {
    Arc::new(MarkCompleted)
  };

  let manager = RecoveryManager::new(Arc::new(repository), executor, config);
  if args.recovery_enabled {
    manager.start();
  }

  let shutdown = CancellationToken::new();
  let trigger = shutdown.clone();
  tokio::spawn(async move {
    shutdown_signal().await;
    trigger.cancel();
  });

  let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
  serve(addr, manager, shutdown, args.shutdown_timeout())
    .await
    .with_context(|| format!("failed to serve on {}", addr))?;

  Ok(())
}

#[tokio::main]
async fn main() {
  dotenv::dotenv().ok();

  let args = ScannerArgs::parse();
  ci_runner_logger::init_logger_with_level(ci_runner_logger::level_from_str(&args.log_level));

  if let Err(err) = run(args).await {
    log::error!("{:#}", err);
    std::process::exit(1);
  }
}
