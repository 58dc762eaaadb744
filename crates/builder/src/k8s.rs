use ci_runner::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::{path::Path, sync::Arc};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
  Pending,
  Running,
  Succeeded,
  Failed,
  Unknown,
}

impl PodPhase {
  pub fn parse(phase: &str) -> Self {
    match phase {
      "Pending" => PodPhase::Pending,
      "Running" => PodPhase::Running,
      "Succeeded" => PodPhase::Succeeded,
      "Failed" => PodPhase::Failed,
      _ => PodPhase::Unknown,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderPod {
  pub name: String,
  pub phase: PodPhase,
  /// Set once the pod is being deleted, e.g. on spot interruption.
  pub terminating: bool,
}

impl BuilderPod {
  pub fn is_live(&self) -> bool {
    self.phase == PodPhase::Running && !self.terminating
  }
}

/// Kubernetes operations on the BuildKit deployments backing buildx nodes.
///
/// The kubernetes driver names the deployment after the node and labels its
/// pods with `app=<node>`.
#[async_trait::async_trait]
pub trait BuilderPodApi: Send + Sync {
  /// Pods of a node, empty when none exist.
  async fn builder_pods(&self, namespace: &str, node: &str) -> Result<Vec<BuilderPod>>;

  /// Cycles the deployment's pods.
  async fn restart_builder(&self, namespace: &str, node: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct PodList {
  #[serde(default)]
  items: Vec<Pod>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pod {
  metadata: PodMetadata,
  #[serde(default)]
  status: PodStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMetadata {
  name: String,
  #[serde(default)]
  deletion_timestamp: Option<String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
  #[serde(default)]
  phase: String,
}

impl From<Pod> for BuilderPod {
  fn from(pod: Pod) -> Self {
    BuilderPod {
      name: pod.metadata.name,
      phase: PodPhase::parse(&pod.status.phase),
      terminating: pod.metadata.deletion_timestamp.is_some(),
    }
  }
}

struct ClientInner {
  http: reqwest::Client,
  base_url: String,
}

/// Minimal in-cluster client for the API server.
#[derive(Clone)]
pub struct KubeClient {
  inner: Arc<ClientInner>,
}

impl KubeClient {
  pub fn new(base_url: impl Into<String>, token: &str, ca_cert: Option<&[u8]>) -> Result<Self> {
    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
      .map_err(|err| Error::internal_runtime_error(format!("invalid service account token: {}", err)))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let mut builder = reqwest::Client::builder().default_headers(headers);

    if let Some(pem) = ca_cert {
      let certificate = reqwest::Certificate::from_pem(pem)
        .map_err(|err| Error::internal_runtime_error(format!("invalid cluster CA: {}", err)))?;
      builder = builder.add_root_certificate(certificate);
    }

    let http = builder.build().map_err(kube_error)?;

    Ok(KubeClient {
      inner: Arc::new(ClientInner {
        http,
        base_url: base_url.into().trim_end_matches('/').to_string(),
      }),
    })
  }

  /// Uses the pod's service account and `KUBERNETES_SERVICE_HOST`/`_PORT`.
  pub fn in_cluster() -> Result<Self> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
      .map_err(|_| Error::internal_runtime_error("KUBERNETES_SERVICE_HOST is not set"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

    let dir = Path::new(SERVICE_ACCOUNT_DIR);
    let token = std::fs::read_to_string(dir.join("token"))?;
    let ca = std::fs::read(dir.join("ca.crt")).ok();

    KubeClient::new(format!("https://{}:{}", host, port), &token, ca.as_deref())
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.inner.base_url, path)
  }
}

fn kube_error(err: reqwest::Error) -> Error {
  Error::internal_runtime_error(format!("kubernetes api: {}", err))
}

#[async_trait::async_trait]
impl BuilderPodApi for KubeClient {
  async fn builder_pods(&self, namespace: &str, node: &str) -> Result<Vec<BuilderPod>> {
    let url = self.url(&format!("/api/v1/namespaces/{}/pods", namespace));
    let response = self
      .inner
      .http
      .get(url)
      .query(&[("labelSelector", format!("app={}", node))])
      .send()
      .await
      .map_err(kube_error)?
      .error_for_status()
      .map_err(kube_error)?;

    let list: PodList = response.json().await.map_err(kube_error)?;

    Ok(
      list
        .items
        .into_iter()
        .map(BuilderPod::from)
        .collect(),
    )
  }

  async fn restart_builder(&self, namespace: &str, node: &str) -> Result<()> {
    let url = self.url(&format!(
      "/apis/apps/v1/namespaces/{}/deployments/{}",
      namespace, node
    ));
    let patch = serde_json::json!({
      "spec": {
        "template": {
          "metadata": {
            "annotations": {
              "kubectl.kubernetes.io/restartedAt": chrono::Utc::now().to_rfc3339(),
            }
          }
        }
      }
    });

    self
      .inner
      .http
      .patch(url)
      .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
      .body(patch.to_string())
      .send()
      .await
      .map_err(kube_error)?
      .error_for_status()
      .map_err(kube_error)?;

    log::info!("Restarted buildkit deployment {}/{}", namespace, node);

    Ok(())
  }
}
