use ci_runner::{BlobStorageConfig, BlobStorageProvider, Error, Result};
use ci_runner_builder::{BuildCommandRunner, CommandSpec};
use ci_runner_exec::shell_quote;
use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

#[async_trait::async_trait]
pub trait BlobStorage: Send + Sync {
  async fn upload(&self, file: &Path, key: &str) -> Result<()>;

  async fn download(&self, key: &str, file: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
  Upload,
  Download,
}

/// Talks to S3, MinIO, GCS and Azure through their CLIs.
pub struct BlobCli {
  runner: Arc<dyn BuildCommandRunner>,
  config: BlobStorageConfig,
  /// Where the GCP service-account key is written
  credentials_dir: PathBuf,
}

impl BlobCli {
  pub fn new(
    runner: Arc<dyn BuildCommandRunner>,
    config: BlobStorageConfig,
    credentials_dir: impl Into<PathBuf>,
  ) -> Self {
    BlobCli {
      runner,
      config,
      credentials_dir: credentials_dir.into(),
    }
  }

  fn gcp_key_file(&self) -> PathBuf {
    self.credentials_dir.join("gcp-credentials.json")
  }

  async fn transfer(&self, direction: Transfer, file: &Path, key: &str) -> Result<()> {
    if self.config.provider == BlobStorageProvider::Gcp && !self.config.gcp_credentials_json.is_empty()
    {
      tokio::fs::create_dir_all(&self.credentials_dir).await?;
      tokio::fs::write(self.gcp_key_file(), &self.config.gcp_credentials_json).await?;
    }

    let command = transfer_command(&self.config, direction, file, key, &self.gcp_key_file());

    self.runner.run(&command, Default::default()).await
  }
}

fn object_url(scheme: &str, bucket: &str, key: &str) -> String {
  format!("{}://{}/{}", scheme, bucket, key.trim_start_matches('/'))
}

/// The CLI invocation moving `file` to or from `key`. Credentials travel in
/// the environment.
pub fn transfer_command(
  config: &BlobStorageConfig,
  direction: Transfer,
  file: &Path,
  key: &str,
  gcp_key_file: &Path,
) -> CommandSpec {
  let file = shell_quote(&file.to_string_lossy());

  match config.provider {
    BlobStorageProvider::S3 | BlobStorageProvider::Minio => {
      let url = shell_quote(&object_url("s3", &config.bucket, key));
      let (from, to) = match direction {
        Transfer::Upload => (file, url),
        Transfer::Download => (url, file),
      };

      let mut script = String::new();
      if config.part_size_mb > 0 {
        script.push_str(&format!(
          "aws configure set default.s3.multipart_chunksize {}MB && ",
          config.part_size_mb
        ));
      }
      script.push_str(&format!("aws s3 cp {} {}", from, to));
      if !config.region.is_empty() {
        script.push_str(&format!(" --region {}", config.region));
      }
      if !config.endpoint.is_empty() {
        script.push_str(&format!(" --endpoint-url {}", shell_quote(&config.endpoint)));
      }

      let mut command = CommandSpec::new(script);
      if !config.access_key.is_empty() {
        command = command
          .env("AWS_ACCESS_KEY_ID", &config.access_key)
          .env("AWS_SECRET_ACCESS_KEY", &config.secret_key);
      }
      command
    }
    BlobStorageProvider::Gcp => {
      let url = shell_quote(&object_url("gs", &config.bucket, key));
      let (from, to) = match direction {
        Transfer::Upload => (file, url),
        Transfer::Download => (url, file),
      };

      let mut script = String::new();
      if !config.gcp_credentials_json.is_empty() {
        script.push_str(&format!(
          "gcloud auth activate-service-account --key-file={} && ",
          shell_quote(&gcp_key_file.to_string_lossy())
        ));
      }
      if config.part_size_mb > 0 {
        script.push_str(&format!(
          "gsutil -o GSUtil:parallel_composite_upload_threshold={}M cp {} {}",
          config.part_size_mb, from, to
        ));
      } else {
        script.push_str(&format!("gsutil cp {} {}", from, to));
      }

      CommandSpec::new(script)
    }
    BlobStorageProvider::Azure => {
      let verb = match direction {
        Transfer::Upload => "upload --overwrite",
        Transfer::Download => "download",
      };

      CommandSpec::new(format!(
        "az storage blob {} --account-name {} --container-name {} --name {} --file {}",
        verb,
        shell_quote(&config.azure_account_name),
        shell_quote(&config.bucket),
        shell_quote(key.trim_start_matches('/')),
        file
      ))
      .env("AZURE_STORAGE_KEY", &config.azure_account_key)
    }
  }
}

#[async_trait::async_trait]
impl BlobStorage for BlobCli {
  async fn upload(&self, file: &Path, key: &str) -> Result<()> {
    log::info!("Uploading {} to {}", file.display(), key);

    self
      .transfer(Transfer::Upload, file, key)
      .await
      .map_err(|err| Error::artifact_upload_failed(format!("{}: {}", key, err)))
  }

  async fn download(&self, key: &str, file: &Path) -> Result<()> {
    log::info!("Downloading {} to {}", key, file.display());

    if let Some(parent) = file.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    self
      .transfer(Transfer::Download, file, key)
      .await
      .map_err(|err| Error::cache_pull_failed(format!("{}: {}", key, err)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key_file() -> PathBuf {
    PathBuf::from("/tmp/creds/gcp-credentials.json")
  }

  #[test]
  fn test_s3_upload() {
    let config = BlobStorageConfig {
      bucket: "ci-logs".to_string(),
      region: "us-east-1".to_string(),
      access_key: "AK".to_string(),
      secret_key: "SK".to_string(),
      part_size_mb: 16,
      ..Default::default()
    };

    let command = transfer_command(
      &config,
      Transfer::Upload,
      Path::new("/tmp/a.zip"),
      "/12/artifacts.zip",
      &key_file(),
    );

    assert_eq!(
      command.script,
      "aws configure set default.s3.multipart_chunksize 16MB && aws s3 cp '/tmp/a.zip' 's3://ci-logs/12/artifacts.zip' --region us-east-1"
    );
    assert_eq!(command.env["AWS_SECRET_ACCESS_KEY"], "SK");
    assert!(!command.script.contains("SK"));
  }

  #[test]
  fn test_minio_download_uses_endpoint() {
    let config = BlobStorageConfig {
      provider: BlobStorageProvider::Minio,
      bucket: "cache".to_string(),
      endpoint: "http://minio:9000".to_string(),
      ..Default::default()
    };

    let command = transfer_command(
      &config,
      Transfer::Download,
      Path::new("/tmp/cache.tar.gz"),
      "cache/app.tar.gz",
      &key_file(),
    );

    assert_eq!(
      command.script,
      "aws s3 cp 's3://cache/cache/app.tar.gz' '/tmp/cache.tar.gz' --endpoint-url 'http://minio:9000'"
    );
    assert!(command.env.is_empty());
  }

  #[test]
  fn test_gcs_and_azure() {
    let gcs = BlobStorageConfig {
      provider: BlobStorageProvider::Gcp,
      bucket: "logs".to_string(),
      gcp_credentials_json: "{}".to_string(),
      ..Default::default()
    };
    let command = transfer_command(&gcs, Transfer::Upload, Path::new("/l"), "k", &key_file());
    assert_eq!(
      command.script,
      "gcloud auth activate-service-account --key-file='/tmp/creds/gcp-credentials.json' && gsutil cp '/l' 'gs://logs/k'"
    );

    let azure = BlobStorageConfig {
      provider: BlobStorageProvider::Azure,
      bucket: "logs".to_string(),
      azure_account_name: "acct".to_string(),
      azure_account_key: "key".to_string(),
      ..Default::default()
    };
    let command = transfer_command(&azure, Transfer::Download, Path::new("/l"), "k", &key_file());
    assert_eq!(
      command.script,
      "az storage blob download --account-name 'acct' --container-name 'logs' --name 'k' --file '/l'"
    );
    assert_eq!(command.env["AZURE_STORAGE_KEY"], "key");
  }
}
