use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An image a step published, reported back with the completion event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginArtifact {
  pub registry: String,
  pub image: String,
  pub digest: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PluginArtifactFile {
  Wrapped { artifacts: Vec<PluginArtifact> },
  List(Vec<PluginArtifact>),
}

/// Ordered set of plugin artifacts accumulated over a stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct PluginArtifacts(Vec<PluginArtifact>);

impl PluginArtifacts {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, artifact: PluginArtifact) -> bool {
    if self.0.contains(&artifact) {
      return false;
    }
    self.0.push(artifact);
    true
  }

  pub fn merge(&mut self, other: PluginArtifacts) {
    for artifact in other.0 {
      self.insert(artifact);
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &PluginArtifact> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn into_vec(self) -> Vec<PluginArtifact> {
    self.0
  }

  pub fn parse(content: &str) -> Result<Self> {
    let file: PluginArtifactFile = serde_json::from_str(content)
      .map_err(|err| Error::bad_request(format!("Invalid plugin artifact file: {}", err)))?;

    let artifacts = match file {
      PluginArtifactFile::Wrapped { artifacts } => artifacts,
      PluginArtifactFile::List(artifacts) => artifacts,
    };

    let mut set = PluginArtifacts::new();
    for artifact in artifacts {
      set.insert(artifact);
    }

    Ok(set)
  }

  /// Reads the hand-off file a step may have produced and removes it.
  /// A missing file yields `None`.
  pub async fn take_from_file(path: &Path) -> Result<Option<Self>> {
    let content = match tokio::fs::read_to_string(path).await {
      Ok(content) => content,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(err) => return Err(err.into()),
    };

    tokio::fs::remove_file(path).await?;

    if content.trim().is_empty() {
      return Ok(Some(PluginArtifacts::new()));
    }

    Self::parse(&content).map(Some)
  }
}

impl FromIterator<PluginArtifact> for PluginArtifacts {
  fn from_iter<T: IntoIterator<Item = PluginArtifact>>(iter: T) -> Self {
    let mut set = PluginArtifacts::new();
    for artifact in iter {
      set.insert(artifact);
    }
    set
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn artifact(image: &str) -> PluginArtifact {
    PluginArtifact {
      registry: "registry.example.com".to_string(),
      image: image.to_string(),
      digest: format!("sha256:{}", image),
    }
  }

  #[test]
  fn test_merge_is_idempotent() {
    let record: PluginArtifacts = vec![artifact("a"), artifact("b")].into_iter().collect();

    let mut accumulated = PluginArtifacts::new();
    accumulated.merge(record.clone());
    accumulated.merge(record.clone());

    assert_eq!(accumulated, record);
    assert_eq!(accumulated.len(), 2);
  }

  #[test]
  fn test_parse_both_shapes() {
    let wrapped = PluginArtifacts::parse(
      r#"{"artifacts":[{"registry":"r","image":"i","digest":"d"},{"registry":"r","image":"i","digest":"d"}]}"#,
    )
    .unwrap();
    let list = PluginArtifacts::parse(r#"[{"registry":"r","image":"i","digest":"d"}]"#).unwrap();

    assert_eq!(wrapped, list);
    assert_eq!(list.len(), 1);
    assert!(PluginArtifacts::parse("{oops").is_err());
  }

  #[ci_runner_test::test]
  async fn test_take_from_file_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pluginArtifacts.json");

    assert_eq!(PluginArtifacts::take_from_file(&path).await.unwrap(), None);

    std::fs::write(&path, r#"[{"registry":"r","image":"i","digest":"d"}]"#).unwrap();
    let taken = PluginArtifacts::take_from_file(&path).await.unwrap().unwrap();

    assert_eq!(taken.len(), 1);
    assert!(!path.exists());
  }
}
