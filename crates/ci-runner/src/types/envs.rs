use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A caller-supplied environment value. Requests may carry numbers and
/// booleans, steps always receive the string form.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EnvironmentVariable {
  String(String),
  Number(f64),
  Boolean(bool),
}

impl std::fmt::Display for EnvironmentVariable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EnvironmentVariable::String(s) => write!(f, "{}", s),
      EnvironmentVariable::Number(n) => write!(f, "{}", n),
      EnvironmentVariable::Boolean(b) => write!(f, "{}", b),
    }
  }
}

impl From<String> for EnvironmentVariable {
  fn from(s: String) -> Self {
    EnvironmentVariable::String(s)
  }
}

impl From<&str> for EnvironmentVariable {
  fn from(s: &str) -> Self {
    EnvironmentVariable::String(s.to_string())
  }
}

impl From<f64> for EnvironmentVariable {
  fn from(n: f64) -> Self {
    EnvironmentVariable::Number(n)
  }
}

impl From<bool> for EnvironmentVariable {
  fn from(b: bool) -> Self {
    EnvironmentVariable::Boolean(b)
  }
}

pub type EnvironmentVariables = HashMap<String, String>;

pub trait EnvironmentVariablesExt {
  /// Inserts every pair of `other`, replacing existing keys.
  fn overlay(&mut self, other: &EnvironmentVariables);
  /// Inserts only the keys of `other` that are not present yet.
  fn fill_missing(&mut self, other: &EnvironmentVariables);
}

impl EnvironmentVariablesExt for EnvironmentVariables {
  fn overlay(&mut self, other: &EnvironmentVariables) {
    for (key, value) in other {
      self.insert(key.clone(), value.clone());
    }
  }

  fn fill_missing(&mut self, other: &EnvironmentVariables) {
    for (key, value) in other {
      self.entry(key.clone()).or_insert_with(|| value.clone());
    }
  }
}

pub fn normalize_environment(
  variables: &HashMap<String, EnvironmentVariable>,
) -> EnvironmentVariables {
  variables
    .iter()
    .map(|(key, value)| (key.clone(), value.to_string()))
    .collect()
}
