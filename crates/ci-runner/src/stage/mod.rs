mod environment;
mod ref_plugin;

pub use environment::*;
pub use ref_plugin::{collect_plugin_outputs, inject_plugin_inputs};

use crate::{
  conditions::{should_trigger_stage, stage_is_success},
  utils::{clean_dir, panic_message},
  variables::{resolve_input_variables, VariableScopes},
  EnvironmentVariables, Error, FileVariable, PluginArtifacts, RefPluginMap, Result,
  ScriptOutputs, ScriptPayload, ScriptRequest, ScriptRunner, StageKind, StageVariables, StepKind,
  StepObject, StepVariables, VariableObject,
};
use std::{
  future::Future,
  path::PathBuf,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::task::{JoinError, JoinHandle};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A step task that is aborted when the stage driving it is dropped, so a
/// timeout around a stage also stops the step.
struct StepHandle<T>(JoinHandle<T>);

impl<T> Future for StepHandle<T> {
  type Output = std::result::Result<T, JoinError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.0).poll(cx)
  }
}

impl<T> Drop for StepHandle<T> {
  fn drop(&mut self) {
    self.0.abort();
  }
}

pub const DEFAULT_MAX_REF_PLUGIN_DEPTH: usize = 8;

const SECRET_NAME_MARKERS: [&str; 3] = ["TOKEN", "PASSWORD", "SECRET"];

#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
  /// Per-step working directory, emptied before every step
  pub work_dir: PathBuf,
  /// Hand-off file steps write plugin artifacts to
  pub plugin_artifacts_file: PathBuf,
  pub max_ref_plugin_depth: usize,
}

impl StageConfig {
  pub fn new(work_dir: impl Into<PathBuf>) -> Self {
    let work_dir = work_dir.into();
    StageConfig {
      plugin_artifacts_file: work_dir.join("pluginArtifacts.json"),
      work_dir,
      max_ref_plugin_depth: DEFAULT_MAX_REF_PLUGIN_DEPTH,
    }
  }
}

#[derive(Debug, Default)]
pub struct StageRunResult {
  pub plugin_artifacts: PluginArtifacts,
  pub output_vars: StageVariables,
  pub failed_step: Option<StepObject>,
  pub error: Option<Error>,
  /// Composed env of the last inline step that ran
  pub script_env: Option<EnvironmentVariables>,
}

impl StageRunResult {
  pub fn is_success(&self) -> bool {
    self.error.is_none()
  }
}

#[derive(Debug)]
enum StepOutcome {
  Skipped,
  Completed {
    outputs: StepVariables,
    plugin_artifacts: PluginArtifacts,
    script_env: Option<EnvironmentVariables>,
  },
}

/// Runs step lists in order. Each step runs on its own task so a panic
/// inside it surfaces as `Error::StepPanic` instead of tearing down the
/// pipeline.
#[derive(Clone)]
pub struct StageExecutor {
  runner: Arc<dyn ScriptRunner>,
  config: Arc<StageConfig>,
}

impl StageExecutor {
  pub fn new(runner: Arc<dyn ScriptRunner>, config: StageConfig) -> Self {
    StageExecutor {
      runner,
      config: Arc::new(config),
    }
  }

  pub fn config(&self) -> &StageConfig {
    &self.config
  }

  pub async fn run_steps(
    &self,
    kind: StageKind,
    steps: &[StepObject],
    ref_plugins: Arc<RefPluginMap>,
    env: &mut VariableEnvironment,
    prior_stage_vars: Option<&StageVariables>,
    reset_on_exit: bool,
  ) -> StageRunResult {
    log::info!("Running {} stage with {} steps", kind, steps.len());

    let result = self
      .clone()
      .run_steps_at_depth(
        kind,
        steps.to_vec(),
        ref_plugins,
        Arc::new(env.clone()),
        prior_stage_vars.cloned().map(Arc::new),
        0,
      )
      .await;

    if reset_on_exit {
      env.reset_existing_script_env();
    } else if let Some(script_env) = &result.script_env {
      env.existing_script_env = script_env.clone();
    }

    match &result.error {
      Some(err) => log::error!("{} stage failed: {}", kind, err),
      None => log::info!("{} stage finished", kind),
    }

    result
  }

  fn run_steps_at_depth(
    self,
    kind: StageKind,
    steps: Vec<StepObject>,
    ref_plugins: Arc<RefPluginMap>,
    env: Arc<VariableEnvironment>,
    prior_stage_vars: Option<Arc<StageVariables>>,
    depth: usize,
  ) -> BoxFuture<StageRunResult> {
    Box::pin(async move {
      let mut result = StageRunResult::default();
      let mut env = env;

      for step in steps {
        let name = step.display_name();

        let task = StepTask {
          executor: self.clone(),
          kind,
          step: step.clone(),
          ref_plugins: ref_plugins.clone(),
          env: env.clone(),
          prior_stage_vars: prior_stage_vars.clone(),
          stage_vars: Arc::new(result.output_vars.clone()),
          depth,
        };

        let outcome = match StepHandle(tokio::spawn(task.run())).await {
          Ok(outcome) => outcome,
          Err(err) if err.is_panic() => Err(Error::step_panic(&name, panic_message(err.into_panic()))),
          Err(err) => Err(Error::internal_runtime_error(format!(
            "step `{}` was aborted: {}",
            name, err
          ))),
        };

        self.collect_plugin_artifacts(&mut result.plugin_artifacts).await;

        match outcome {
          Ok(StepOutcome::Skipped) => {
            log::info!("Step `{}` skipped", name);
          }
          Ok(StepOutcome::Completed {
            outputs,
            plugin_artifacts,
            script_env,
          }) => {
            log::info!("Step `{}` completed", name);
            result.plugin_artifacts.merge(plugin_artifacts);
            result.output_vars.insert(step.index, outputs);

            if let Some(script_env) = script_env {
              let mut next = (*env).clone();
              next.existing_script_env = script_env.clone();
              env = Arc::new(next);
              result.script_env = Some(script_env);
            }
          }
          Err(err) => {
            log::error!("Step `{}` failed: {}", name, err);
            result.failed_step = Some(step);
            result.error = Some(err);
            break;
          }
        }
      }

      result
    })
  }

  async fn collect_plugin_artifacts(&self, accumulated: &mut PluginArtifacts) {
    match PluginArtifacts::take_from_file(&self.config.plugin_artifacts_file).await {
      Ok(Some(artifacts)) => {
        log::trace!("Collected {} plugin artifacts", artifacts.len());
        accumulated.merge(artifacts);
      }
      Ok(None) => {}
      Err(err) => log::warn!("Failed to read plugin artifacts: {}", err),
    }
  }
}

/// One step, owned so it can run on its own task.
pub(crate) struct StepTask {
  executor: StageExecutor,
  kind: StageKind,
  step: StepObject,
  ref_plugins: Arc<RefPluginMap>,
  env: Arc<VariableEnvironment>,
  prior_stage_vars: Option<Arc<StageVariables>>,
  stage_vars: Arc<StageVariables>,
  depth: usize,
}

impl StepTask {
  fn scopes(&self) -> VariableScopes<'_> {
    let global = &self.env.system_env;
    let stage_vars = Some(self.stage_vars.as_ref());

    match self.kind {
      StageKind::Pre => VariableScopes {
        pre: stage_vars,
        ..VariableScopes::globals(global)
      },
      StageKind::Post => VariableScopes {
        pre: self.prior_stage_vars.as_deref(),
        post: stage_vars,
        ..VariableScopes::globals(global)
      },
      StageKind::RefPlugin => VariableScopes {
        ref_plugin: stage_vars,
        ..VariableScopes::globals(global)
      },
      StageKind::Scanning => VariableScopes::globals(global),
    }
  }

  async fn run(self) -> Result<StepOutcome> {
    let name = self.step.display_name();

    let inputs = resolve_input_variables(&self.step.input_vars, self.scopes())?;

    if !should_trigger_stage(&self.step.trigger_skip_conditions, &inputs)? {
      return Ok(StepOutcome::Skipped);
    }

    clean_dir(&self.executor.config.work_dir).await?;

    log::info!("Running step `{}` ({} stage)", name, self.kind);

    let (captured, plugin_artifacts, script_env) = match self.step.kind()? {
      StepKind::RefPlugin { plugin_id } => {
        let (captured, artifacts) = self.run_ref_plugin(plugin_id, &inputs).await?;
        (captured, artifacts, None)
      }
      StepKind::Shell { script } => {
        let payload = ScriptPayload::Shell {
          script: script.to_string(),
        };
        let (captured, script_env) = self.run_inline(payload, &inputs).await?;
        (captured, PluginArtifacts::new(), Some(script_env))
      }
      StepKind::Container {
        image,
        command,
        args,
        script,
      } => {
        let payload = ScriptPayload::Container {
          image: image.to_string(),
          command: command.to_string(),
          args: args.to_vec(),
          script: script.to_string(),
          exposed_ports: self.step.exposed_ports.clone(),
          custom_script_mount: self.step.custom_script_mount.clone(),
          source_code_mount: self.step.source_code_mount.clone(),
          extra_volume_mounts: self.step.extra_volume_mounts.clone(),
        };
        let (captured, script_env) = self.run_inline(payload, &inputs).await?;
        (captured, PluginArtifacts::new(), Some(script_env))
      }
    };

    let outputs = populate_output_variables(&self.step.output_vars, &captured)?;
    let output_list: Vec<VariableObject> = outputs.values().cloned().collect();

    if !stage_is_success(&self.step.success_failure_conditions, &output_list)? {
      return Err(Error::condition_failed(name));
    }

    Ok(StepOutcome::Completed {
      outputs,
      plugin_artifacts,
      script_env,
    })
  }

  /// Returns the captured outputs and the env the script ran with.
  async fn run_inline(
    &self,
    payload: ScriptPayload,
    inputs: &[VariableObject],
  ) -> Result<(ScriptOutputs, EnvironmentVariables)> {
    let script_env = self.env.compose_step_env(inputs);
    let request = ScriptRequest {
      step_name: self.step.display_name(),
      script_name: self.step.script_name(),
      work_dir: self.executor.config.work_dir.clone(),
      env: script_env.clone(),
      output_var_names: self.step.output_var_names(),
      file_variables: file_variables(inputs),
      artifact_paths: self.step.artifact_paths.clone(),
      secrets: secret_values(inputs),
      payload,
    };

    let captured = self.executor.runner.run(request).await?;

    Ok((captured, script_env))
  }
}

fn file_variables(inputs: &[VariableObject]) -> Vec<FileVariable> {
  inputs
    .iter()
    .filter(|v| v.is_file() && !v.value.is_empty())
    .map(|v| FileVariable {
      name: v.name.clone(),
      mount_path: v.value.clone(),
      content: v.file_content.clone().unwrap_or_default(),
    })
    .collect()
}

fn secret_values(inputs: &[VariableObject]) -> Vec<String> {
  inputs
    .iter()
    .filter(|v| !v.value.is_empty())
    .filter(|v| {
      let name = v.name.to_ascii_uppercase();
      SECRET_NAME_MARKERS.iter().any(|marker| name.contains(marker))
    })
    .map(|v| v.value.clone())
    .collect()
}

/// Copies captured values into the declared output variables. Variables
/// without a value are dropped.
pub fn populate_output_variables(
  declared: &[VariableObject],
  captured: &ScriptOutputs,
) -> Result<StepVariables> {
  let mut outputs = StepVariables::new();

  for variable in declared {
    let Some(value) = captured.get(&variable.name).filter(|v| !v.is_empty()) else {
      continue;
    };

    let mut variable = variable.clone().with_value(value.clone());
    variable.type_check()?;
    outputs.insert(variable.name.clone(), variable);
  }

  Ok(outputs)
}
