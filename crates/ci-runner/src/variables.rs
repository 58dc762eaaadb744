use crate::{EnvironmentVariables, Error, Result, VariableObject, VariableType};
use std::collections::HashMap;

/// Output variables of one step, by name.
pub type StepVariables = HashMap<String, VariableObject>;

/// Output variables of a stage, by step index.
pub type StageVariables = HashMap<usize, StepVariables>;

/// The places a reference may point into. A `None` scope is not visible
/// from the current stage.
#[derive(Debug, Clone, Copy)]
pub struct VariableScopes<'a> {
  pub pre: Option<&'a StageVariables>,
  pub post: Option<&'a StageVariables>,
  pub ref_plugin: Option<&'a StageVariables>,
  pub global: &'a EnvironmentVariables,
}

impl<'a> VariableScopes<'a> {
  pub fn globals(global: &'a EnvironmentVariables) -> Self {
    VariableScopes {
      pre: None,
      post: None,
      ref_plugin: None,
      global,
    }
  }

  fn lookup(
    scope: Option<&StageVariables>,
    variable_type: VariableType,
    variable: &VariableObject,
  ) -> Result<VariableObject> {
    let scope = scope.ok_or_else(|| {
      Error::runtime_variable_not_found(format!(
        "variable `{}` references {:?} outputs which are not visible here",
        variable.name, variable_type
      ))
    })?;

    scope
      .get(&variable.reference_variable_step_index)
      .and_then(|outputs| outputs.get(&variable.reference_variable_name))
      .cloned()
      .ok_or_else(|| {
        Error::runtime_variable_not_found(format!(
          "variable `{}` references `{}` of step {} which has not produced it",
          variable.name, variable.reference_variable_name, variable.reference_variable_step_index
        ))
      })
  }
}

/// Fills `value` (and `typed_value`) of every input variable from its
/// source and type checks the result.
pub fn resolve_input_variables(
  variables: &[VariableObject],
  scopes: VariableScopes<'_>,
) -> Result<Vec<VariableObject>> {
  let mut resolved = Vec::with_capacity(variables.len());

  for variable in variables {
    let mut variable = variable.clone();

    match variable.variable_type {
      VariableType::Value => {}
      VariableType::RefGlobal => {
        variable.value = scopes
          .global
          .get(&variable.reference_variable_name)
          .cloned()
          .unwrap_or_default();
      }
      variable_type @ (VariableType::RefPreCi | VariableType::RefPostCi | VariableType::RefPlugin) => {
        let scope = match variable_type {
          VariableType::RefPreCi => scopes.pre,
          VariableType::RefPostCi => scopes.post,
          _ => scopes.ref_plugin,
        };

        let source = VariableScopes::lookup(scope, variable_type, &variable)?;
        variable.value = source.value;
        if variable.is_file() && source.file_content.is_some() {
          variable.file_content = source.file_content;
        }
      }
    }

    variable.type_check()?;
    resolved.push(variable);
  }

  Ok(resolved)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{TypedValue, VariableFormat};

  fn reference(name: &str, variable_type: VariableType, step: usize, target: &str) -> VariableObject {
    VariableObject {
      name: name.to_string(),
      variable_type,
      reference_variable_step_index: step,
      reference_variable_name: target.to_string(),
      ..Default::default()
    }
  }

  fn stage(step: usize, name: &str, value: &str) -> StageVariables {
    let mut outputs = StepVariables::new();
    outputs.insert(
      name.to_string(),
      VariableObject::new(name, VariableFormat::String).with_value(value),
    );
    StageVariables::from([(step, outputs)])
  }

  #[test]
  fn test_resolve_every_source() {
    let global = EnvironmentVariables::from([("REGION".to_string(), "eu".to_string())]);
    let pre = stage(1, "K", "pre-value");
    let post = stage(2, "K", "post-value");

    let scopes = VariableScopes {
      pre: Some(&pre),
      post: Some(&post),
      ref_plugin: None,
      global: &global,
    };

    let mut literal = VariableObject::new("n", VariableFormat::Number).with_value("3");
    literal.variable_type = VariableType::Value;

    let resolved = resolve_input_variables(
      &[
        literal,
        reference("region", VariableType::RefGlobal, 0, "REGION"),
        reference("absent", VariableType::RefGlobal, 0, "NOPE"),
        reference("a", VariableType::RefPreCi, 1, "K"),
        reference("b", VariableType::RefPostCi, 2, "K"),
      ],
      scopes,
    )
    .unwrap();

    let values: Vec<&str> = resolved.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(values, vec!["3", "eu", "", "pre-value", "post-value"]);
    assert_eq!(resolved[0].typed_value, Some(TypedValue::Number(3.0)));
  }

  #[test]
  fn test_dangling_reference() {
    let global = EnvironmentVariables::new();
    let pre = stage(1, "K", "v");
    let scopes = VariableScopes {
      pre: Some(&pre),
      ..VariableScopes::globals(&global)
    };

    let not_run = resolve_input_variables(&[reference("a", VariableType::RefPreCi, 2, "K")], scopes);
    assert!(matches!(not_run, Err(Error::RuntimeVariableNotFound(_))));

    let wrong_name = resolve_input_variables(&[reference("a", VariableType::RefPreCi, 1, "X")], scopes);
    assert!(matches!(wrong_name, Err(Error::RuntimeVariableNotFound(_))));

    let invisible =
      resolve_input_variables(&[reference("a", VariableType::RefPlugin, 1, "K")], scopes);
    assert!(matches!(invisible, Err(Error::RuntimeVariableNotFound(_))));
  }

  #[test]
  fn test_resolved_value_is_type_checked() {
    let global = EnvironmentVariables::new();
    let pre = stage(1, "K", "not-a-number");
    let scopes = VariableScopes {
      pre: Some(&pre),
      ..VariableScopes::globals(&global)
    };

    let mut variable = reference("a", VariableType::RefPreCi, 1, "K");
    variable.format = VariableFormat::Number;

    assert!(matches!(
      resolve_input_variables(&[variable], scopes),
      Err(Error::TypeCoercion(_))
    ));
  }
}
