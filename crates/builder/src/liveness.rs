use crate::{BuilderPodApi, BuildxDriver};
use ci_runner::{Error, Result};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchedNode {
  namespace: String,
  name: String,
}

/// Polls the builder pods of a kubernetes driver.
#[derive(Clone)]
pub struct LivenessWatcher {
  api: Arc<dyn BuilderPodApi>,
  nodes: Vec<WatchedNode>,
  interval: Duration,
}

impl LivenessWatcher {
  pub fn new(api: Arc<dyn BuilderPodApi>, driver: &BuildxDriver, interval: Duration) -> Self {
    let nodes = driver
      .nodes()
      .iter()
      .map(|node| WatchedNode {
        namespace: node.namespace.clone(),
        name: node.name.clone(),
      })
      .collect();

    LivenessWatcher {
      api,
      nodes,
      interval,
    }
  }

  /// Describes the first node without a live pod. API errors are logged
  /// and do not count as a lost node.
  pub async fn lost_node(&self) -> Option<String> {
    for node in &self.nodes {
      match self.api.builder_pods(&node.namespace, &node.name).await {
        Ok(pods) if pods.is_empty() => {
          return Some(format!("no pod found for builder node {}", node.name));
        }
        Ok(pods) => {
          if let Some(pod) = pods.iter().find(|pod| !pod.is_live()) {
            return Some(format!(
              "pod {} of builder node {} is {:?}{}",
              pod.name,
              node.name,
              pod.phase,
              if pod.terminating { " (terminating)" } else { "" }
            ));
          }
        }
        Err(err) => {
          log::warn!("Failed to check builder node {}: {}", node.name, err);
        }
      }
    }

    None
  }

  /// Cancels `build` as soon as a builder pod is lost. The watch ends
  /// when `build` is cancelled or the returned handle is stopped.
  pub fn spawn(self, build: CancellationToken) -> WatchHandle {
    let stop = build.child_token();
    let watch_stop = stop.clone();

    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = watch_stop.cancelled() => return None,
          _ = tokio::time::sleep(self.interval) => {}
        }

        if let Some(reason) = self.lost_node().await {
          log::warn!("Builder lost during build: {}", reason);
          build.cancel();
          return Some(reason);
        }
      }
    });

    WatchHandle { stop, handle }
  }

  /// Waits until every node has only live pods.
  pub async fn wait_until_ready(&self, timeout: Duration, poll: Duration) -> Result<()> {
    let wait = async {
      while self.lost_node().await.is_some() {
        tokio::time::sleep(poll).await;
      }
    };

    tokio::time::timeout(timeout, wait).await.map_err(|_| {
      Error::builder_pod_deleted(format!(
        "builder pods were not running after {}",
        humantime::format_duration(timeout)
      ))
    })
  }
}

pub struct WatchHandle {
  stop: CancellationToken,
  handle: JoinHandle<Option<String>>,
}

impl WatchHandle {
  /// Stops watching; returns why the build was cancelled, if it was.
  pub async fn stop(self) -> Option<String> {
    self.stop.cancel();

    match self.handle.await {
      Ok(reason) => reason,
      Err(err) => {
        log::error!("Liveness watcher failed: {}", err);
        None
      }
    }
  }
}
