use anyhow::Context;
use ci_runner_exec::WorkflowLogger;
use ci_runner_pipeline::{
  collaborators, Pipeline, RunnerArgs, RunnerConfig, StageError, EXIT_FAILURE, EXIT_SUCCESS,
};
use clap::Parser;

async fn run(args: &RunnerArgs) -> anyhow::Result<()> {
  let request = args.load_request()?;
  let config = RunnerConfig::from(args);

  let logger = WorkflowLogger::with_file(&config.log_file)
    .with_context(|| format!("failed to open {}", config.log_file.display()))?;
  logger.register_secrets(request.secret_values());

  log::info!(
    "Running {:?} workflow {} of pipeline {}",
    request.workflow_type,
    request.workflow_id,
    request.pipeline_id
  );

  let deps = collaborators(&request, &config, &logger)?;
  Pipeline::new(request, config, logger, deps).run().await?;

  Ok(())
}

#[tokio::main]
async fn main() {
  dotenv::dotenv().ok();

  let args = RunnerArgs::parse();
  ci_runner_logger::init_logger_with_level(ci_runner_logger::level_from_str(&args.log_level));

  let code = match run(&args).await {
    Ok(()) => EXIT_SUCCESS,
    Err(err) => {
      log::error!("{:#}", err);
      err
        .downcast_ref::<StageError>()
        .map(StageError::exit_code)
        .unwrap_or(EXIT_FAILURE)
    }
  };

  std::process::exit(code);
}
