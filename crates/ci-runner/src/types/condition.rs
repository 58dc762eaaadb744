use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, str::FromStr};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
  #[default]
  Trigger,
  Skip,
  Pass,
  Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
  Equal,
  NotEqual,
  Less,
  LessOrEqual,
  Greater,
  GreaterOrEqual,
}

impl ConditionOperator {
  pub fn as_str(&self) -> &'static str {
    match self {
      ConditionOperator::Equal => "==",
      ConditionOperator::NotEqual => "!=",
      ConditionOperator::Less => "<",
      ConditionOperator::LessOrEqual => "<=",
      ConditionOperator::Greater => ">",
      ConditionOperator::GreaterOrEqual => ">=",
    }
  }

  /// The operator whose result is always the opposite of this one.
  pub fn negate(&self) -> ConditionOperator {
    match self {
      ConditionOperator::Equal => ConditionOperator::NotEqual,
      ConditionOperator::NotEqual => ConditionOperator::Equal,
      ConditionOperator::Less => ConditionOperator::GreaterOrEqual,
      ConditionOperator::LessOrEqual => ConditionOperator::Greater,
      ConditionOperator::Greater => ConditionOperator::LessOrEqual,
      ConditionOperator::GreaterOrEqual => ConditionOperator::Less,
    }
  }

  pub fn is_equality(&self) -> bool {
    matches!(self, ConditionOperator::Equal | ConditionOperator::NotEqual)
  }

  pub fn matches(&self, ordering: Ordering) -> bool {
    match self {
      ConditionOperator::Equal => ordering == Ordering::Equal,
      ConditionOperator::NotEqual => ordering != Ordering::Equal,
      ConditionOperator::Less => ordering == Ordering::Less,
      ConditionOperator::LessOrEqual => ordering != Ordering::Greater,
      ConditionOperator::Greater => ordering == Ordering::Greater,
      ConditionOperator::GreaterOrEqual => ordering != Ordering::Less,
    }
  }
}

impl FromStr for ConditionOperator {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim() {
      "==" => Ok(ConditionOperator::Equal),
      "!=" => Ok(ConditionOperator::NotEqual),
      "<" => Ok(ConditionOperator::Less),
      "<=" => Ok(ConditionOperator::LessOrEqual),
      ">" => Ok(ConditionOperator::Greater),
      ">=" => Ok(ConditionOperator::GreaterOrEqual),
      other => Err(Error::unsupported_operator(other)),
    }
  }
}

impl std::fmt::Display for ConditionOperator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// `<conditionOnVariable> <conditionOperator> <conditionalValue>`
///
/// The operator stays a string on the wire so that an unknown operator is
/// reported when the condition is evaluated rather than when the request is
/// parsed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionObject {
  pub condition_type: ConditionType,
  pub condition_on_variable: String,
  pub condition_operator: String,
  pub conditional_value: String,
}

impl ConditionObject {
  pub fn new(
    condition_type: ConditionType,
    variable: impl Into<String>,
    operator: impl Into<String>,
    value: impl Into<String>,
  ) -> Self {
    ConditionObject {
      condition_type,
      condition_on_variable: variable.into(),
      condition_operator: operator.into(),
      conditional_value: value.into(),
    }
  }

  pub fn operator(&self) -> Result<ConditionOperator> {
    self.condition_operator.parse()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const OPERATORS: [ConditionOperator; 6] = [
    ConditionOperator::Equal,
    ConditionOperator::NotEqual,
    ConditionOperator::Less,
    ConditionOperator::LessOrEqual,
    ConditionOperator::Greater,
    ConditionOperator::GreaterOrEqual,
  ];

  #[test]
  fn test_parse_operator() {
    for operator in OPERATORS {
      assert_eq!(operator.as_str().parse::<ConditionOperator>().unwrap(), operator);
    }

    assert_eq!(
      "=~".parse::<ConditionOperator>().unwrap_err(),
      Error::unsupported_operator("=~")
    );
  }

  #[test]
  fn test_negate_flips_every_ordering() {
    for operator in OPERATORS {
      for ordering in [Ordering::Less, Ordering::Equal, Ordering::Greater] {
        assert_eq!(operator.negate().matches(ordering), !operator.matches(ordering));
      }
      assert_eq!(operator.negate().negate(), operator);
    }
  }

  #[test]
  fn test_deserialize_condition() {
    let condition: ConditionObject = serde_json::from_str(
      r#"{"conditionType":"SKIP","conditionOnVariable":"env","conditionOperator":"==","conditionalValue":"preview"}"#,
    )
    .unwrap();

    assert_eq!(condition.condition_type, ConditionType::Skip);
    assert_eq!(condition.operator().unwrap(), ConditionOperator::Equal);
  }
}
