use ci_runner::{BuildpackConfig, Error, Result};
use std::path::Path;

pub fn pack_build_command(dest: &str, config: &BuildpackConfig) -> String {
  let project_path = if config.project_path.is_empty() {
    "."
  } else {
    &config.project_path
  };

  let mut command = format!(
    "pack build {} --path {} --builder {}",
    dest, project_path, config.builder_id
  );

  for (key, value) in &config.args {
    command.push_str(&format!(" --env {}={}", key, value));
  }

  for buildpack in &config.build_packs {
    command.push_str(&format!(" --buildpack {}", buildpack));
  }

  command
}

pub fn remove_builder_command(builder_id: &str) -> String {
  format!("docker image rm {}", builder_id)
}

/// Pins the language version for builders that read it from a project file.
pub async fn write_language_file(project_dir: &Path, config: &BuildpackConfig) -> Result<()> {
  let version = config.language_version.trim();
  if version.is_empty() {
    return Ok(());
  }

  match config.language.to_lowercase().as_str() {
    "node" | "nodejs" => {
      let path = project_dir.join("package.json");
      let mut package: serde_json::Value = match tokio::fs::read_to_string(&path).await {
        Ok(content) => serde_json::from_str(&content)
          .map_err(|err| Error::build_failed(format!("invalid {}: {}", path.display(), err)))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => serde_json::json!({}),
        Err(err) => return Err(err.into()),
      };

      let Some(object) = package.as_object_mut() else {
        return Err(Error::build_failed(format!(
          "{} is not a JSON object",
          path.display()
        )));
      };

      let engines = object
        .entry("engines")
        .or_insert_with(|| serde_json::json!({}));
      if let Some(engines) = engines.as_object_mut() {
        engines.insert("node".to_string(), serde_json::Value::from(version));
      }

      let content = serde_json::to_string_pretty(&package)
        .map_err(|err| Error::build_failed(format!("failed to write package.json: {}", err)))?;
      tokio::fs::write(&path, content).await?;
    }
    "python" => {
      tokio::fs::write(project_dir.join("runtime.txt"), format!("python-{}\n", version)).await?;
    }
    "java" => {
      let path = project_dir.join("system.properties");
      let existing = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
      };

      let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| !line.trim_start().starts_with("java.runtime.version"))
        .map(|line| line.to_string())
        .collect();
      lines.push(format!("java.runtime.version={}", version));

      tokio::fs::write(&path, lines.join("\n") + "\n").await?;
    }
    other => {
      log::debug!("No language file for `{}`", other);
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn config(language: &str, version: &str) -> BuildpackConfig {
    BuildpackConfig {
      builder_id: "paketobuildpacks/builder:base".to_string(),
      language: language.to_string(),
      language_version: version.to_string(),
      project_path: "./app".to_string(),
      args: BTreeMap::from([("BP_NODE_RUN_SCRIPTS".to_string(), "build".to_string())]),
      ..Default::default()
    }
  }

  #[test]
  fn test_pack_build_command() {
    assert_eq!(
      pack_build_command("reg/app:1", &config("node", "18")),
      "pack build reg/app:1 --path ./app --builder paketobuildpacks/builder:base --env BP_NODE_RUN_SCRIPTS=build"
    );
    assert_eq!(
      remove_builder_command("paketobuildpacks/builder:base"),
      "docker image rm paketobuildpacks/builder:base"
    );
  }

  #[ci_runner_test::test]
  async fn test_node_engine_is_merged_into_package_json() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("package.json"), r#"{"name":"app","engines":{"npm":"9"}}"#).unwrap();

    write_language_file(dir.path(), &config("node", "18.x")).await.unwrap();

    let package: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(dir.path().join("package.json")).unwrap())
        .unwrap();
    assert_eq!(package["name"], "app");
    assert_eq!(package["engines"]["npm"], "9");
    assert_eq!(package["engines"]["node"], "18.x");
  }

  #[ci_runner_test::test]
  async fn test_python_and_java_files() {
    let dir = tempfile::tempdir().unwrap();

    write_language_file(dir.path(), &config("python", "3.11")).await.unwrap();
    assert_eq!(
      std::fs::read_to_string(dir.path().join("runtime.txt")).unwrap(),
      "python-3.11\n"
    );

    std::fs::write(dir.path().join("system.properties"), "java.runtime.version=11\nfoo=bar\n").unwrap();
    write_language_file(dir.path(), &config("java", "17")).await.unwrap();
    assert_eq!(
      std::fs::read_to_string(dir.path().join("system.properties")).unwrap(),
      "foo=bar\njava.runtime.version=17\n"
    );

    write_language_file(dir.path(), &config("go", "")).await.unwrap();
  }
}
