use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{cmp::Ordering, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VariableFormat {
  #[default]
  String,
  Number,
  Bool,
  Date,
  File,
}

impl VariableFormat {
  pub fn as_str(&self) -> &'static str {
    match self {
      VariableFormat::String => "STRING",
      VariableFormat::Number => "NUMBER",
      VariableFormat::Bool => "BOOL",
      VariableFormat::Date => "DATE",
      VariableFormat::File => "FILE",
    }
  }
}

impl FromStr for VariableFormat {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "STRING" | "" => Ok(VariableFormat::String),
      "NUMBER" => Ok(VariableFormat::Number),
      "BOOL" | "BOOLEAN" => Ok(VariableFormat::Bool),
      "DATE" => Ok(VariableFormat::Date),
      "FILE" => Ok(VariableFormat::File),
      other => Err(Error::bad_request(format!(
        "unknown variable format `{}`",
        other
      ))),
    }
  }
}

impl Serialize for VariableFormat {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for VariableFormat {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariableType {
  #[default]
  Value,
  RefPreCi,
  RefPostCi,
  RefGlobal,
  RefPlugin,
}

/// A variable value coerced to its declared format.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
  String(String),
  Number(f64),
  Bool(bool),
  Date(DateTime<Utc>),
  /// Path the file content is mounted at
  File(String),
}

impl TypedValue {
  pub fn coerce(format: VariableFormat, raw: &str) -> Result<TypedValue> {
    match format {
      VariableFormat::String => Ok(TypedValue::String(raw.to_string())),
      VariableFormat::File => Ok(TypedValue::File(raw.to_string())),
      VariableFormat::Number => {
        let number = raw
          .trim()
          .parse::<f64>()
          .map_err(|_| Error::type_coercion(format!("`{}` is not a valid number", raw)))?;

        if number.is_nan() {
          return Err(Error::type_coercion(format!("`{}` is not a valid number", raw)));
        }

        Ok(TypedValue::Number(number))
      }
      VariableFormat::Bool => parse_bool(raw.trim())
        .map(TypedValue::Bool)
        .ok_or_else(|| Error::type_coercion(format!("`{}` is not a valid bool", raw))),
      VariableFormat::Date => parse_date(raw.trim())
        .map(TypedValue::Date)
        .ok_or_else(|| Error::type_coercion(format!("`{}` is not a valid date", raw))),
    }
  }

  pub fn format(&self) -> VariableFormat {
    match self {
      TypedValue::String(_) => VariableFormat::String,
      TypedValue::Number(_) => VariableFormat::Number,
      TypedValue::Bool(_) => VariableFormat::Bool,
      TypedValue::Date(_) => VariableFormat::Date,
      TypedValue::File(_) => VariableFormat::File,
    }
  }

  /// Total ordering between two values of the same format. Booleans are
  /// not ordered.
  pub fn compare(&self, other: &TypedValue) -> Option<Ordering> {
    match (self, other) {
      (TypedValue::Number(a), TypedValue::Number(b)) => a.partial_cmp(b),
      (TypedValue::String(a), TypedValue::String(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
      (TypedValue::File(a), TypedValue::File(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
      (TypedValue::Date(a), TypedValue::Date(b)) => Some(a.cmp(b)),
      _ => None,
    }
  }
}

impl std::fmt::Display for TypedValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TypedValue::String(s) | TypedValue::File(s) => write!(f, "{}", s),
      TypedValue::Number(n) => write!(f, "{}", n),
      TypedValue::Bool(b) => write!(f, "{}", b),
      TypedValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
    }
  }
}

fn parse_bool(raw: &str) -> Option<bool> {
  match raw {
    "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
    "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
    _ => None,
  }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
  if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
    return Some(date.with_timezone(&Utc));
  }

  if let Ok(date) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
    return Some(date.and_utc());
  }

  NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    .ok()
    .and_then(|date| date.and_hms_opt(0, 0, 0))
    .map(|date| date.and_utc())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableObject {
  pub name: String,
  pub format: VariableFormat,
  /// String form of the value as it travels on the wire
  pub value: String,
  pub variable_type: VariableType,
  pub reference_variable_name: String,
  pub reference_variable_step_index: usize,
  /// Ref-plugin steps only: the index of the sub-step this variable maps to
  pub variable_step_index_in_plugin: usize,
  /// Content of a `FILE` variable, mounted at `value`
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file_content: Option<String>,
  #[serde(skip)]
  pub typed_value: Option<TypedValue>,
}

impl VariableObject {
  pub fn new(name: impl Into<String>, format: VariableFormat) -> Self {
    VariableObject {
      name: name.into(),
      format,
      ..Default::default()
    }
  }

  pub fn with_value(mut self, value: impl Into<String>) -> Self {
    self.value = value.into();
    self
  }

  /// Fills `typed_value` from `value`. Empty values stay untyped.
  pub fn type_check(&mut self) -> Result<()> {
    if self.value.is_empty() {
      self.typed_value = match self.format {
        VariableFormat::String => Some(TypedValue::String(String::new())),
        _ => None,
      };
      return Ok(());
    }

    let typed = TypedValue::coerce(self.format, &self.value).map_err(|err| match err {
      Error::TypeCoercion(message) => {
        Error::type_coercion(format!("variable `{}`: {}", self.name, message))
      }
      other => other,
    })?;

    self.typed_value = Some(typed);

    Ok(())
  }

  pub fn is_file(&self) -> bool {
    self.format == VariableFormat::File
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_coerce_number() {
    assert_eq!(
      TypedValue::coerce(VariableFormat::Number, "20").unwrap(),
      TypedValue::Number(20.0)
    );
    assert_eq!(
      TypedValue::coerce(VariableFormat::Number, "8.5").unwrap(),
      TypedValue::Number(8.5)
    );
    assert!(matches!(
      TypedValue::coerce(VariableFormat::Number, "NOT_A_NUMBER"),
      Err(Error::TypeCoercion(_))
    ));
    assert!(TypedValue::coerce(VariableFormat::Number, "NaN").is_err());
  }

  #[test]
  fn test_coerce_bool() {
    for raw in ["1", "t", "T", "TRUE", "true", "True"] {
      assert_eq!(
        TypedValue::coerce(VariableFormat::Bool, raw).unwrap(),
        TypedValue::Bool(true)
      );
    }
    for raw in ["0", "f", "F", "FALSE", "false", "False"] {
      assert_eq!(
        TypedValue::coerce(VariableFormat::Bool, raw).unwrap(),
        TypedValue::Bool(false)
      );
    }
    assert!(TypedValue::coerce(VariableFormat::Bool, "yes").is_err());
  }

  #[test]
  fn test_coerce_date() {
    let rfc = TypedValue::coerce(VariableFormat::Date, "2023-05-01T10:00:00+02:00").unwrap();
    let plain = TypedValue::coerce(VariableFormat::Date, "2023-05-01").unwrap();
    let spaced = TypedValue::coerce(VariableFormat::Date, "2023-05-01 08:00:00").unwrap();

    assert_eq!(rfc, spaced);
    assert_eq!(plain.compare(&rfc), Some(Ordering::Less));
    assert!(TypedValue::coerce(VariableFormat::Date, "yesterday").is_err());
  }

  #[test]
  fn test_string_comparison_is_bytewise() {
    let a = TypedValue::String("B".to_string());
    let b = TypedValue::String("a".to_string());

    assert_eq!(a.compare(&b), Some(Ordering::Less));
    assert_eq!(TypedValue::Bool(true).compare(&TypedValue::Bool(false)), None);
  }

  #[test]
  fn test_format_is_case_insensitive() {
    let variable: VariableObject =
      serde_json::from_str(r#"{"name":"age","format":"number","value":"20"}"#).unwrap();
    assert_eq!(variable.format, VariableFormat::Number);

    let err = serde_json::from_str::<VariableObject>(r#"{"name":"x","format":"blob"}"#);
    assert!(err.is_err());
  }

  #[test]
  fn test_type_check() {
    let mut variable = VariableObject::new("age", VariableFormat::Number).with_value("20");
    variable.type_check().unwrap();
    assert_eq!(variable.typed_value, Some(TypedValue::Number(20.0)));

    let mut empty = VariableObject::new("age", VariableFormat::Number);
    empty.type_check().unwrap();
    assert_eq!(empty.typed_value, None);

    let mut invalid = VariableObject::new("age", VariableFormat::Number).with_value("abc");
    assert_eq!(
      invalid.type_check().unwrap_err(),
      Error::type_coercion("variable `age`: `abc` is not a valid number")
    );
  }

  #[test]
  fn test_variable_type_wire_names() {
    let variable: VariableObject = serde_json::from_str(
      r#"{"name":"x","variableType":"REF_PRE_CI","referenceVariableName":"y","referenceVariableStepIndex":2}"#,
    )
    .unwrap();

    assert_eq!(variable.variable_type, VariableType::RefPreCi);
    assert_eq!(variable.reference_variable_step_index, 2);
  }
}
