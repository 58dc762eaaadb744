use crate::{BuildCommand, CacheMode};
use ci_runner::Result;
use std::path::{Path, PathBuf};

/// `linux/arm/v7` -> `linux-arm-v7`
pub fn platform_dir_name(platform: &str) -> String {
  platform.trim().replace('/', "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheExport {
  /// One `--cache-to` on the main build.
  Inline,
  /// One export build per platform, run after the main build.
  PerPlatform,
}

/// Local BuildKit cache under the cache mount.
///
/// `cache/` receives the export of the current build; the previous export is
/// moved to `cache-old/` and imported from there.
#[derive(Debug, Clone)]
pub struct BuildxCache {
  current: PathBuf,
  old: PathBuf,
  mode: CacheMode,
  export: CacheExport,
}

impl BuildxCache {
  pub fn new(root: &Path, mode: CacheMode, export: CacheExport) -> Self {
    BuildxCache {
      current: root.join("cache"),
      old: root.join("cache-old"),
      mode,
      export,
    }
  }

  pub fn current_dir(&self) -> &Path {
    &self.current
  }

  pub fn old_dir(&self) -> &Path {
    &self.old
  }

  pub fn export(&self) -> CacheExport {
    self.export
  }

  /// Moves the previous cache aside and leaves an empty export directory.
  pub async fn prepare(&self) -> Result<()> {
    if tokio::fs::try_exists(&self.old).await? {
      tokio::fs::remove_dir_all(&self.old).await?;
    }

    if tokio::fs::try_exists(&self.current).await? {
      tokio::fs::rename(&self.current, &self.old).await?;
    } else {
      tokio::fs::create_dir_all(&self.old).await?;
    }

    tokio::fs::create_dir_all(&self.current).await?;

    log::debug!(
      "Prepared buildx cache at {} (previous at {})",
      self.current.display(),
      self.old.display()
    );

    Ok(())
  }

  pub fn platform_dir(&self, platform: &str) -> PathBuf {
    self.current.join(platform_dir_name(platform))
  }

  pub fn old_platform_dir(&self, platform: &str) -> PathBuf {
    self.old.join(platform_dir_name(platform))
  }

  /// Adds the cache flags to the main build.
  pub fn apply(&self, command: BuildCommand, platforms: &[String]) -> BuildCommand {
    match self.export {
      CacheExport::Inline => command
        .cache_to(self.current.to_string_lossy(), self.mode)
        .cache_from(self.old.to_string_lossy()),
      CacheExport::PerPlatform => platforms.iter().fold(command, |command, platform| {
        command.cache_from(self.old_platform_dir(platform).to_string_lossy())
      }),
    }
  }

  /// One export build per platform, each writing to its own directory.
  /// `base` is the build before platforms, push and cache flags are added.
  pub fn export_commands(&self, base: &BuildCommand, platforms: &[String]) -> Vec<BuildCommand> {
    if self.export != CacheExport::PerPlatform {
      return vec![];
    }

    platforms
      .iter()
      .map(|platform| {
        base
          .clone()
          .platforms(std::slice::from_ref(platform))
          .cache_to(self.platform_dir(platform).to_string_lossy(), self.mode)
          .cache_from(self.old_platform_dir(platform).to_string_lossy())
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn platforms() -> Vec<String> {
    vec!["linux/amd64".to_string(), "linux/arm64".to_string()]
  }

  #[test]
  fn test_platform_dir_name() {
    assert_eq!(platform_dir_name("linux/arm/v7"), "linux-arm-v7");
    assert_eq!(platform_dir_name(" linux/amd64 "), "linux-amd64");
  }

  #[test]
  fn test_inline_export_adds_one_pair() {
    let cache = BuildxCache::new(Path::new("/cache"), CacheMode::Max, CacheExport::Inline);
    let command = cache.apply(BuildCommand::buildx(), &platforms()).render();

    assert_eq!(command.matches("--cache-to=").count(), 1);
    assert!(command.contains("--cache-to=type=local,dest=/cache/cache,mode=max"));
    assert_eq!(command.matches("--cache-from=").count(), 1);
    assert!(command.contains("--cache-from=type=local,src=/cache/cache-old"));
    assert!(cache.export_commands(&BuildCommand::buildx(), &platforms()).is_empty());
  }

  #[test]
  fn test_per_platform_export_dirs_match_platforms() {
    let cache = BuildxCache::new(Path::new("/c"), CacheMode::Min, CacheExport::PerPlatform);
    let base = BuildCommand::buildx().tag("reg/app:1");
    let main = cache.apply(base.clone().platforms(&platforms()).push(), &platforms());

    assert!(!main.render().contains("--cache-to"));
    assert_eq!(main.render().matches("--cache-from=").count(), 2);

    let exports: Vec<String> = cache
      .export_commands(&base, &platforms())
      .iter()
      .map(|c| c.render())
      .collect();

    assert_eq!(exports.len(), 2);
    assert!(exports[0].contains("--platform linux/amd64 "));
    assert!(exports[0].contains("--cache-to=type=local,dest=/c/cache/linux-amd64,mode=min"));
    assert!(exports[1].contains("--cache-to=type=local,dest=/c/cache/linux-arm64,mode=min"));
    assert!(exports.iter().all(|c| !c.contains("--push")));
  }

  #[ci_runner_test::test]
  async fn test_prepare_moves_previous_cache_aside() {
    let dir = tempfile::tempdir().unwrap();
    let cache = BuildxCache::new(dir.path(), CacheMode::Max, CacheExport::Inline);

    cache.prepare().await.unwrap();
    std::fs::write(cache.current_dir().join("index.json"), "{}").unwrap();

    cache.prepare().await.unwrap();

    assert!(cache.old_dir().join("index.json").exists());
    assert!(cache.current_dir().exists());
    assert_eq!(std::fs::read_dir(cache.current_dir()).unwrap().count(), 0);
  }
}
