use ci_runner::{Error, Result, WorkflowRequest};
use serde::Serialize;
use std::time::Duration;

#[derive(Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageScanRequest {
  pub image: String,
  pub image_digest: String,
  pub pipeline_id: i64,
  pub ci_artifact_id: i64,
  pub app_id: i64,
  pub workflow_id: i64,
  pub triggered_by: i64,
  pub docker_registry_id: String,
}

impl ImageScanRequest {
  pub fn new(request: &WorkflowRequest, image: &str, digest: &str) -> Self {
    ImageScanRequest {
      image: image.to_string(),
      image_digest: digest.to_string(),
      pipeline_id: request.pipeline_id,
      ci_artifact_id: request.ci_artifact_id,
      app_id: request.app_id,
      workflow_id: request.workflow_id,
      triggered_by: request.triggered_by,
      docker_registry_id: request.docker_registry_id.clone(),
    }
  }
}

#[async_trait::async_trait]
pub trait ImageScanner: Send + Sync {
  async fn scan(&self, request: &ImageScanRequest) -> Result<()>;
}

/// Hands the image to the scanner service at `<endpoint>/scanner/image`.
pub struct HttpImageScanner {
  http: reqwest::Client,
  endpoint: String,
  max_retries: u32,
  retry_delay: Duration,
}

impl HttpImageScanner {
  pub fn new(endpoint: impl Into<String>, max_retries: u32, retry_delay: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|err| Error::scan_failed(err.to_string()))?;

    Ok(HttpImageScanner {
      http,
      endpoint: endpoint.into().trim_end_matches('/').to_string(),
      max_retries,
      retry_delay,
    })
  }

  async fn post(&self, request: &ImageScanRequest) -> Result<()> {
    let response = self
      .http
      .post(format!("{}/scanner/image", self.endpoint))
      .json(request)
      .send()
      .await
      .map_err(|err| Error::scan_failed(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(Error::scan_failed(format!("scanner returned {}: {}", status, body)));
    }

    Ok(())
  }
}

#[async_trait::async_trait]
impl ImageScanner for HttpImageScanner {
  async fn scan(&self, request: &ImageScanRequest) -> Result<()> {
    let mut attempt = 0;

    loop {
      match self.post(request).await {
        Ok(()) => return Ok(()),
        Err(err) if attempt < self.max_retries => {
          attempt += 1;
          log::warn!("Image scan attempt {} failed: {}", attempt, err);
          tokio::time::sleep(self.retry_delay).await;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
