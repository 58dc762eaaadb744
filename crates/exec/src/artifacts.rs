use ci_runner::Result;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// `path` with its root and prefix stripped, for joining under a target dir.
pub fn relative_path(path: &Path) -> PathBuf {
  path
    .components()
    .filter(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    .collect()
}

/// Copies a file or directory tree. Returns the number of files copied.
pub async fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
  let metadata = tokio::fs::metadata(source).await?;

  if metadata.is_file() {
    if let Some(parent) = target.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, target).await?;
    return Ok(1);
  }

  let mut copied = 0;
  for entry in WalkDir::new(source).follow_links(true) {
    let entry = entry.map_err(|err| {
      std::io::Error::new(std::io::ErrorKind::Other, format!("walk {:?}: {}", source, err))
    })?;

    let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
    let destination = target.join(relative);

    if entry.file_type().is_dir() {
      tokio::fs::create_dir_all(&destination).await?;
    } else {
      if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
      }
      tokio::fs::copy(entry.path(), &destination).await?;
      copied += 1;
    }
  }

  Ok(copied)
}

/// Copies every path (glob patterns allowed) into `target_dir`, keeping
/// the path below it. Missing paths are logged and skipped.
pub async fn collect_artifacts(paths: &[String], base: &Path, target_dir: &Path) -> Result<usize> {
  let mut copied = 0;

  for artifact_path in paths.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
    let absolute = if Path::new(artifact_path).is_absolute() {
      PathBuf::from(artifact_path)
    } else {
      base.join(artifact_path)
    };

    let matches: Vec<PathBuf> = match absolute.to_str().map(glob::glob) {
      Some(Ok(paths)) => paths.filter_map(|p| p.ok()).collect(),
      _ => vec![absolute.clone()],
    };

    let existing: Vec<PathBuf> = matches.into_iter().filter(|p| p.exists()).collect();
    if existing.is_empty() {
      log::warn!("Artifact path {} does not exist, skipping", artifact_path);
      continue;
    }

    for source in existing {
      let relative = source.strip_prefix(base).unwrap_or(&source);
      let target = target_dir.join(relative_path(relative));
      copied += copy_tree(&source, &target).await?;
    }
  }

  Ok(copied)
}
