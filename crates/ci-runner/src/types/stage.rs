use serde::{Deserialize, Serialize};

/// The scope a step list runs in. Decides where references resolve.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
  Pre,
  Post,
  RefPlugin,
  Scanning,
}

impl StageKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      StageKind::Pre => "PRE",
      StageKind::Post => "POST",
      StageKind::RefPlugin => "REF_PLUGIN",
      StageKind::Scanning => "SCANNING",
    }
  }
}

impl std::fmt::Display for StageKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}
