use crate::BlobStorage;
use ci_runner::{Error, Result, WorkflowRequest};
use ci_runner_builder::{BuildCommandRunner, CommandSpec};
use ci_runner_exec::shell_quote;
use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

pub fn cache_key(request: &WorkflowRequest) -> String {
  let name = if request.ci_cache_file_name.is_empty() {
    format!("{}-cache.tar.gz", request.pipeline_id)
  } else {
    request.ci_cache_file_name.clone()
  };

  join_key(&request.ci_cache_location, &name)
}

pub fn artifact_key(request: &WorkflowRequest) -> String {
  if request.ci_artifact_location.is_empty() {
    format!("{}/artifacts.zip", request.workflow_id)
  } else {
    request.ci_artifact_location.clone()
  }
}

fn join_key(prefix: &str, name: &str) -> String {
  let prefix = prefix.trim_end_matches('/');

  if prefix.is_empty() {
    name.to_string()
  } else {
    format!("{}/{}", prefix, name)
  }
}

fn quoted(path: &Path) -> String {
  shell_quote(&path.to_string_lossy())
}

/// Build cache and artifact transfers between the pod and blob storage.
pub struct WorkspaceStorage {
  blob: Arc<dyn BlobStorage>,
  runner: Arc<dyn BuildCommandRunner>,
  /// Archives are staged here before upload and after download
  scratch_dir: PathBuf,
}

impl WorkspaceStorage {
  pub fn new(
    blob: Arc<dyn BlobStorage>,
    runner: Arc<dyn BuildCommandRunner>,
    scratch_dir: impl Into<PathBuf>,
  ) -> Self {
    WorkspaceStorage {
      blob,
      runner,
      scratch_dir: scratch_dir.into(),
    }
  }

  fn cache_archive(&self) -> PathBuf {
    self.scratch_dir.join("cache.tar.gz")
  }

  async fn shell(&self, script: String) -> Result<()> {
    self
      .runner
      .run(&CommandSpec::new(script), Default::default())
      .await
  }

  /// Restores the build cache into `cache_dir`.
  pub async fn pull_cache(&self, request: &WorkflowRequest, cache_dir: &Path) -> Result<()> {
    let archive = self.cache_archive();

    async {
      tokio::fs::create_dir_all(&self.scratch_dir).await?;
      self.blob.download(&cache_key(request), &archive).await?;
      tokio::fs::create_dir_all(cache_dir).await?;
      self
        .shell(format!("tar -xzf {} -C {}", quoted(&archive), quoted(cache_dir)))
        .await
    }
    .await
    .map_err(|err| match err {
      Error::CachePullFailed(_) => err,
      err => Error::cache_pull_failed(err.to_string()),
    })
  }

  pub async fn push_cache(&self, request: &WorkflowRequest, cache_dir: &Path) -> Result<()> {
    let archive = self.cache_archive();

    tokio::fs::create_dir_all(&self.scratch_dir).await?;
    self
      .shell(format!("tar -czf {} -C {} .", quoted(&archive), quoted(cache_dir)))
      .await?;

    self.blob.upload(&archive, &cache_key(request)).await
  }

  /// Zips `staging_dir` and uploads it together with the workflow log.
  /// Returns whether anything was uploaded.
  pub async fn upload_artifacts(
    &self,
    request: &WorkflowRequest,
    staging_dir: &Path,
    log_file: &Path,
  ) -> Result<bool> {
    let mut uploaded = false;

    let result: Result<()> = async {
      if has_entries(staging_dir).await {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let archive = self.scratch_dir.join(format!("{}-artifacts.zip", request.workflow_id));

        self
          .shell(format!(
            "cd {} && zip -r {} .",
            quoted(staging_dir),
            quoted(&archive)
          ))
          .await?;
        self.blob.upload(&archive, &artifact_key(request)).await?;
        uploaded = true;
      } else {
        log::info!("No artifacts in {}", staging_dir.display());
      }

      if !request.blob_storage_logs_key.is_empty() && tokio::fs::try_exists(log_file).await? {
        self.blob.upload(log_file, &request.blob_storage_logs_key).await?;
      }

      Ok(())
    }
    .await;

    result.map_err(|err| match err {
      Error::ArtifactUploadFailed(_) => err,
      err => Error::artifact_upload_failed(err.to_string()),
    })?;

    Ok(uploaded)
  }
}

async fn has_entries(dir: &Path) -> bool {
  match tokio::fs::read_dir(dir).await {
    Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
    Err(_) => false,
  }
}
