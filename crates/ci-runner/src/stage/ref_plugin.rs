use super::StepTask;
use crate::{
  Error, PluginArtifacts, Result, ScriptOutputs, StageKind, StageVariables, StepObject,
  VariableObject, VariableType,
};
use std::sync::Arc;

/// Overrides the matching input variable of the targeted sub-step with the
/// caller's resolved value.
pub fn inject_plugin_inputs(sub_steps: &mut [StepObject], inputs: &[VariableObject]) {
  for input in inputs {
    let Some(sub_step) = sub_steps
      .iter_mut()
      .find(|s| s.index == input.variable_step_index_in_plugin)
    else {
      log::warn!(
        "Plugin input `{}` targets step {} which the plugin does not have",
        input.name,
        input.variable_step_index_in_plugin
      );
      continue;
    };

    for variable in sub_step
      .input_vars
      .iter_mut()
      .filter(|v| v.name == input.name)
    {
      variable.value = input.value.clone();
      variable.file_content = input.file_content.clone();
      variable.variable_type = VariableType::Value;
      variable.typed_value = None;
    }
  }
}

/// Picks the caller's declared outputs out of the sub-stage outputs.
pub fn collect_plugin_outputs(
  declared: &[VariableObject],
  sub_outputs: &StageVariables,
) -> ScriptOutputs {
  declared
    .iter()
    .filter_map(|output| {
      sub_outputs
        .get(&output.variable_step_index_in_plugin)
        .and_then(|step_outputs| step_outputs.get(&output.name))
        .map(|variable| (output.name.clone(), variable.value.clone()))
    })
    .collect()
}

impl StepTask {
  pub(super) async fn run_ref_plugin(
    &self,
    plugin_id: i64,
    inputs: &[VariableObject],
  ) -> Result<(ScriptOutputs, PluginArtifacts)> {
    let max_depth = self.executor.config.max_ref_plugin_depth;
    if self.depth + 1 > max_depth {
      return Err(Error::recursion_limit(max_depth));
    }

    let mut sub_steps = self
      .ref_plugins
      .get(&plugin_id)
      .cloned()
      .ok_or_else(|| {
        Error::bad_request(format!(
          "step `{}` references unknown plugin {}",
          self.step.display_name(),
          plugin_id
        ))
      })?;

    inject_plugin_inputs(&mut sub_steps, inputs);

    let mut sub_env = (*self.env).clone();
    sub_env.existing_script_env = self.env.compose_step_env(inputs);

    log::info!(
      "Expanding plugin {} for step `{}` ({} steps, depth {})",
      plugin_id,
      self.step.display_name(),
      sub_steps.len(),
      self.depth + 1
    );

    let result = self
      .executor
      .clone()
      .run_steps_at_depth(
        StageKind::RefPlugin,
        sub_steps,
        self.ref_plugins.clone(),
        Arc::new(sub_env),
        None,
        self.depth + 1,
      )
      .await;

    if let Some(err) = result.error {
      return Err(err);
    }

    let outputs = collect_plugin_outputs(&self.step.output_vars, &result.output_vars);

    Ok((outputs, result.plugin_artifacts))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{StepVariables, VariableFormat};

  #[test]
  fn test_inject_targets_indexed_sub_step() {
    let mut sub_steps = vec![
      StepObject {
        index: 1,
        input_vars: vec![VariableObject::new("x", VariableFormat::Number)],
        ..Default::default()
      },
      StepObject {
        index: 2,
        input_vars: vec![VariableObject::new("x", VariableFormat::Number)],
        ..Default::default()
      },
    ];

    let mut input = VariableObject::new("x", VariableFormat::Number).with_value("7");
    input.variable_step_index_in_plugin = 2;

    inject_plugin_inputs(&mut sub_steps, &[input]);

    assert_eq!(sub_steps[0].input_vars[0].value, "");
    assert_eq!(sub_steps[1].input_vars[0].value, "7");
  }

  #[test]
  fn test_outputs_are_subset_of_sub_stage_outputs() {
    let mut step_outputs = StepVariables::new();
    step_outputs.insert(
      "y".to_string(),
      VariableObject::new("y", VariableFormat::String).with_value("7"),
    );
    let sub_outputs = StageVariables::from([(1, step_outputs)]);

    let mut y = VariableObject::new("y", VariableFormat::String);
    y.variable_step_index_in_plugin = 1;
    let mut z = VariableObject::new("z", VariableFormat::String);
    z.variable_step_index_in_plugin = 1;

    let outputs = collect_plugin_outputs(&[y, z], &sub_outputs);

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs.get("y").unwrap(), "7");
  }
}
