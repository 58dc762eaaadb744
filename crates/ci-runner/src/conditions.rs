use crate::{
  ConditionObject, ConditionOperator, ConditionType, Error, Result, TypedValue, VariableObject,
};

/// Evaluates `<variable> <op> <literal>` against the variable of the same
/// name in `variables`. Both sides are coerced to the variable's format.
pub fn evaluate(condition: &ConditionObject, variables: &[VariableObject]) -> Result<bool> {
  let name = condition.condition_on_variable.trim();
  if name.is_empty() {
    return Err(Error::invalid_condition(format!(
      "{:?} condition has no variable",
      condition.condition_type
    )));
  }

  let variable = variables
    .iter()
    .find(|v| v.name == name)
    .ok_or_else(|| Error::undefined_variable(name))?;

  let operator = condition.operator()?;

  let lhs = TypedValue::coerce(variable.format, &variable.value)
    .map_err(|err| Error::type_coercion(format!("variable `{}`: {}", name, err_message(err))))?;
  let rhs = TypedValue::coerce(variable.format, &condition.conditional_value).map_err(|err| {
    Error::type_coercion(format!("condition on `{}`: {}", name, err_message(err)))
  })?;

  compare(name, operator, &lhs, &rhs)
}

fn compare(
  name: &str,
  operator: ConditionOperator,
  lhs: &TypedValue,
  rhs: &TypedValue,
) -> Result<bool> {
  if let (TypedValue::Bool(a), TypedValue::Bool(b)) = (lhs, rhs) {
    return match operator {
      ConditionOperator::Equal => Ok(a == b),
      ConditionOperator::NotEqual => Ok(a != b),
      other => Err(Error::unsupported_operator(format!(
        "{} on bool variable `{}`",
        other, name
      ))),
    };
  }

  let ordering = lhs.compare(rhs).ok_or_else(|| {
    Error::invalid_condition(format!("values of `{}` are not comparable", name))
  })?;

  Ok(operator.matches(ordering))
}

fn err_message(err: Error) -> String {
  match err {
    Error::TypeCoercion(message) => message,
    other => other.to_string(),
  }
}

fn evaluate_group(
  conditions: &[ConditionObject],
  variables: &[VariableObject],
  positive: ConditionType,
) -> Result<bool> {
  let Some(first) = conditions.first() else {
    return Ok(true);
  };

  let mut all = true;
  for condition in conditions {
    // Every condition is evaluated so that a broken one is never hidden
    // behind an earlier `false`.
    let matched = evaluate(condition, variables)?;
    all = all && matched;
  }

  log::trace!(
    "Evaluated {} {:?} conditions: {}",
    conditions.len(),
    first.condition_type,
    all
  );

  if first.condition_type == positive {
    Ok(all)
  } else {
    Ok(!all)
  }
}

/// TRIGGER conditions run the step when they all hold, SKIP conditions
/// skip it. An empty list triggers.
pub fn should_trigger_stage(
  conditions: &[ConditionObject],
  variables: &[VariableObject],
) -> Result<bool> {
  if let Some(condition) = conditions
    .iter()
    .find(|c| !matches!(c.condition_type, ConditionType::Trigger | ConditionType::Skip))
  {
    return Err(Error::invalid_condition(format!(
      "{:?} is not a trigger/skip condition",
      condition.condition_type
    )));
  }

  evaluate_group(conditions, variables, ConditionType::Trigger)
}

/// PASS conditions succeed when they all hold, FAIL conditions fail the
/// step. An empty list succeeds.
pub fn stage_is_success(
  conditions: &[ConditionObject],
  variables: &[VariableObject],
) -> Result<bool> {
  if let Some(condition) = conditions
    .iter()
    .find(|c| !matches!(c.condition_type, ConditionType::Pass | ConditionType::Fail))
  {
    return Err(Error::invalid_condition(format!(
      "{:?} is not a success/failure condition",
      condition.condition_type
    )));
  }

  evaluate_group(conditions, variables, ConditionType::Pass)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::VariableFormat;

  fn var(name: &str, format: VariableFormat, value: &str) -> VariableObject {
    VariableObject::new(name, format).with_value(value)
  }

  fn cond(condition_type: ConditionType, name: &str, op: &str, value: &str) -> ConditionObject {
    ConditionObject::new(condition_type, name, op, value)
  }

  #[test]
  fn test_numeric_comparison_is_not_lexicographic() {
    let vars = vec![var("age", VariableFormat::Number, "20")];

    assert!(evaluate(&cond(ConditionType::Pass, "age", ">", "8.5"), &vars).unwrap());
    assert!(!evaluate(&cond(ConditionType::Pass, "age", "<", "8.5"), &vars).unwrap());
  }

  #[test]
  fn test_coercion_failure() {
    let vars = vec![var("age", VariableFormat::Number, "NOT_A_NUMBER")];

    assert!(matches!(
      evaluate(&cond(ConditionType::Pass, "age", "==", "1"), &vars),
      Err(Error::TypeCoercion(_))
    ));

    let vars = vec![var("age", VariableFormat::Number, "1")];
    assert!(matches!(
      evaluate(&cond(ConditionType::Pass, "age", "==", "one"), &vars),
      Err(Error::TypeCoercion(_))
    ));
  }

  #[test]
  fn test_undefined_variable() {
    assert_eq!(
      evaluate(&cond(ConditionType::Trigger, "missing", "==", "1"), &[]).unwrap_err(),
      Error::undefined_variable("missing")
    );
    assert!(matches!(
      evaluate(&cond(ConditionType::Trigger, "", "==", "1"), &[]),
      Err(Error::InvalidCondition(_))
    ));
  }

  #[test]
  fn test_unsupported_operator() {
    let vars = vec![var("name", VariableFormat::String, "a")];

    assert_eq!(
      evaluate(&cond(ConditionType::Pass, "name", "=~", "a"), &vars).unwrap_err(),
      Error::unsupported_operator("=~")
    );

    let vars = vec![var("flag", VariableFormat::Bool, "true")];
    assert!(evaluate(&cond(ConditionType::Pass, "flag", "==", "T"), &vars).unwrap());
    assert!(evaluate(&cond(ConditionType::Pass, "flag", "!=", "0"), &vars).unwrap());
    assert!(matches!(
      evaluate(&cond(ConditionType::Pass, "flag", ">", "false"), &vars),
      Err(Error::UnsupportedOperator(_))
    ));
  }

  #[test]
  fn test_dates_and_strings() {
    let vars = vec![
      var("at", VariableFormat::Date, "2023-05-01"),
      var("env", VariableFormat::String, "preview"),
    ];

    assert!(evaluate(&cond(ConditionType::Pass, "at", "<", "2023-05-01T00:00:01Z"), &vars).unwrap());
    assert!(evaluate(&cond(ConditionType::Pass, "env", ">", "Preview"), &vars).unwrap());
  }

  #[test]
  fn test_negated_operator_negates_result() {
    let vars = vec![var("n", VariableFormat::Number, "5")];

    for op in ["==", "!=", "<", "<=", ">", ">="] {
      for literal in ["4", "5", "6"] {
        let condition = cond(ConditionType::Pass, "n", op, literal);
        let negated = cond(
          ConditionType::Pass,
          "n",
          condition.operator().unwrap().negate().as_str(),
          literal,
        );

        assert_eq!(
          evaluate(&negated, &vars).unwrap(),
          !evaluate(&condition, &vars).unwrap()
        );
      }
    }
  }

  #[test]
  fn test_group_semantics() {
    let vars = vec![var("env", VariableFormat::String, "preview")];

    assert!(should_trigger_stage(&[], &vars).unwrap());
    assert!(stage_is_success(&[], &vars).unwrap());

    let skip = vec![cond(ConditionType::Skip, "env", "==", "preview")];
    assert!(!should_trigger_stage(&skip, &vars).unwrap());

    let trigger = vec![
      cond(ConditionType::Trigger, "env", "==", "preview"),
      cond(ConditionType::Trigger, "env", "!=", "prod"),
    ];
    assert!(should_trigger_stage(&trigger, &vars).unwrap());

    let fail = vec![cond(ConditionType::Fail, "env", "==", "preview")];
    assert!(!stage_is_success(&fail, &vars).unwrap());

    let pass = vec![cond(ConditionType::Pass, "env", "==", "prod")];
    assert!(!stage_is_success(&pass, &vars).unwrap());

    assert!(matches!(
      should_trigger_stage(&pass, &vars),
      Err(Error::InvalidCondition(_))
    ));
  }
}
