use crate::{EnvironmentVariables, EnvironmentVariablesExt, VariableObject};

/// The environment layers a step's env map is composed from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableEnvironment {
  /// Process-wide values such as registry coordinates, `DIGEST`, `DEST`
  pub system_env: EnvironmentVariables,
  /// Caller-supplied overrides from the workflow request
  pub runtime_env: EnvironmentVariables,
  /// Composed env of the last inline step, or of the enclosing ref-plugin
  /// step inside a plugin
  pub existing_script_env: EnvironmentVariables,
}

impl VariableEnvironment {
  pub fn new(system_env: EnvironmentVariables, runtime_env: EnvironmentVariables) -> Self {
    VariableEnvironment {
      system_env,
      runtime_env,
      existing_script_env: EnvironmentVariables::new(),
    }
  }

  pub fn set_system_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.system_env.insert(key.into(), value.into());
  }

  /// runtime -> existing script env -> inputs -> system (absent keys only)
  pub fn compose_step_env(&self, inputs: &[VariableObject]) -> EnvironmentVariables {
    let mut env = self.runtime_env.clone();
    env.overlay(&self.existing_script_env);

    for variable in inputs {
      env.insert(variable.name.clone(), variable.value.clone());
    }

    env.fill_missing(&self.system_env);

    env
  }

  pub fn reset_existing_script_env(&mut self) {
    self.existing_script_env.clear();
  }
}
