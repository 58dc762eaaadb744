use crate::{EnvironmentVariables, MountPath, Result};
use std::{collections::BTreeMap, path::PathBuf};

/// A `FILE` input variable: `content` is made available at `mount_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileVariable {
  pub name: String,
  pub mount_path: String,
  pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptPayload {
  Shell {
    script: String,
  },
  Container {
    image: String,
    command: String,
    args: Vec<String>,
    script: String,
    exposed_ports: BTreeMap<u16, u16>,
    custom_script_mount: Option<MountPath>,
    source_code_mount: Option<MountPath>,
    extra_volume_mounts: Vec<MountPath>,
  },
}

impl ScriptPayload {
  pub fn is_container(&self) -> bool {
    matches!(self, ScriptPayload::Container { .. })
  }
}

/// Everything an executor needs to run one inline step.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
  pub step_name: String,
  pub script_name: String,
  pub work_dir: PathBuf,
  pub env: EnvironmentVariables,
  pub output_var_names: Vec<String>,
  pub file_variables: Vec<FileVariable>,
  pub artifact_paths: Vec<String>,
  /// Values masked in the workflow log
  pub secrets: Vec<String>,
  pub payload: ScriptPayload,
}

/// Captured outputs of a script, restricted to the requested names.
pub type ScriptOutputs = EnvironmentVariables;

/// Runs an inline step and returns the values it wrote for the requested
/// output variables. A non-zero exit is an `Error::CommandFailed`.
#[async_trait::async_trait]
pub trait ScriptRunner: Send + Sync {
  async fn run(&self, request: ScriptRequest) -> Result<ScriptOutputs>;
}

/// Parses `KEY=VALUE` lines, keeping only `names`. Later lines win.
pub fn parse_output_env(content: &str, names: &[String]) -> ScriptOutputs {
  let mut outputs = ScriptOutputs::new();

  for line in content.lines() {
    let line = line.trim_end_matches('\r');
    let line = line.strip_prefix("export ").unwrap_or(line);

    let Some((key, value)) = line.split_once('=') else {
      continue;
    };

    let key = key.trim();
    if names.iter().any(|name| name == key) {
      outputs.insert(key.to_string(), unquote(value.trim()).to_string());
    }
  }

  outputs
}

fn unquote(value: &str) -> &str {
  for quote in ['"', '\''] {
    if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
      return &value[1..value.len() - 1];
    }
  }
  value
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_output_env() {
    let names = vec!["K".to_string(), "URL".to_string(), "EMPTY".to_string()];
    let outputs = parse_output_env(
      "K=V\nIGNORED=1\nexport URL=\"http://a/b?c=d\"\nnot a pair\nEMPTY=\nK=W\r\n",
      &names,
    );

    assert_eq!(outputs.get("K").unwrap(), "W");
    assert_eq!(outputs.get("URL").unwrap(), "http://a/b?c=d");
    assert_eq!(outputs.get("EMPTY").unwrap(), "");
    assert!(!outputs.contains_key("IGNORED"));
  }
}
