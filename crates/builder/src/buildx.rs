use ci_runner::{BuildxConfig, Error, RegistryConnection, Result};
use ci_runner_exec::shell_quote;
use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
};

pub const BUILDKITD_FLAGS: &str =
  "--allow-insecure-entitlement network.host --allow-insecure-entitlement security.insecure";

const BUILDER_PREFIX: &str = "ci-runner-builder";
const NODE_PREFIX: &str = "ci-runner-buildkit";

/// Lifecycle of a builder node.
///
/// `Absent -> Created -> Ready -> Running -> {Interrupted, Done}`, an
/// interrupted node becomes `Ready` again once its pods are back and every
/// state may fall back to `Absent` on cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
  Absent,
  Created,
  Ready,
  Running,
  Interrupted,
  Done,
}

impl NodeState {
  pub fn can_transition_to(&self, next: NodeState) -> bool {
    use NodeState::*;

    matches!(
      (*self, next),
      (Absent, Created)
        | (Created, Ready)
        | (Ready, Running)
        | (Running, Interrupted)
        | (Running, Done)
        | (Interrupted, Ready)
        | (_, Absent)
    )
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuilderNode {
  pub name: String,
  pub platform: String,
  pub namespace: String,
  pub driver_options: BTreeMap<String, String>,
  state: NodeState,
}

impl BuilderNode {
  pub fn state(&self) -> NodeState {
    self.state
  }

  pub fn transition(&mut self, next: NodeState) -> Result<()> {
    if self.state == next {
      return Ok(());
    }

    if !self.state.can_transition_to(next) {
      return Err(Error::internal_runtime_error(format!(
        "builder node {} cannot move from {:?} to {:?}",
        self.name, self.state, next
      )));
    }

    log::trace!("Builder node {}: {:?} -> {:?}", self.name, self.state, next);
    self.state = next;

    Ok(())
  }
}

fn short_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn driver_opt(key: &str, value: &str) -> String {
  let opt = format!("{}={}", key, value);

  // buildx splits driver options as CSV
  if opt.contains(',') {
    format!("--driver-opt={}", shell_quote(&format!("\"{}\"", opt)))
  } else {
    format!("--driver-opt={}", shell_quote(&opt))
  }
}

/// Labels of the runner pod from the downward-API volume, one `key="value"`
/// per line.
pub fn parse_podinfo_labels(content: &str) -> BTreeMap<String, String> {
  content
    .lines()
    .filter_map(|line| {
      let (key, value) = line.trim().split_once('=')?;
      let key = key.trim();
      if key.is_empty() {
        return None;
      }
      Some((key.to_string(), value.trim().trim_matches('"').to_string()))
    })
    .collect()
}

pub fn read_podinfo_labels(path: &Path) -> BTreeMap<String, String> {
  match std::fs::read_to_string(path) {
    Ok(content) => parse_podinfo_labels(&content),
    Err(err) => {
      log::debug!("No pod labels at {}: {}", path.display(), err);
      BTreeMap::new()
    }
  }
}

/// buildkitd.toml registry section for registries that need one.
pub fn buildkitd_config(
  registry: &str,
  connection: &RegistryConnection,
  certs_dir: &Path,
) -> Option<String> {
  match connection {
    RegistryConnection::Secure => None,
    RegistryConnection::Insecure => Some(format!(
      "[registry.\"{}\"]\n  http = true\n  insecure = true\n",
      registry
    )),
    RegistryConnection::SecureWithCert => Some(format!(
      "[registry.\"{}\"]\n  ca = [\"{}\"]\n",
      registry,
      certs_dir.join(registry).join("ca.crt").display()
    )),
  }
}

/// The buildx builder used for one build. It is the only thing that creates
/// and removes builder nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildxDriver {
  SingleHost {
    config_file: Option<PathBuf>,
  },
  Kubernetes {
    builder: String,
    nodes: Vec<BuilderNode>,
    driver_image: Option<String>,
    labels: BTreeMap<String, String>,
    config_file: Option<PathBuf>,
  },
}

impl BuildxDriver {
  pub fn single_host(config_file: Option<PathBuf>) -> Self {
    BuildxDriver::SingleHost { config_file }
  }

  /// One node per configured entry; names get a random suffix so that
  /// concurrent workflows in one namespace never share a deployment.
  pub fn kubernetes(
    config: &BuildxConfig,
    labels: BTreeMap<String, String>,
    config_file: Option<PathBuf>,
  ) -> Self {
    let nodes = config
      .nodes
      .iter()
      .map(|node| {
        let prefix = node
          .name
          .clone()
          .filter(|name| !name.is_empty())
          .unwrap_or_else(|| format!("{}-{}", NODE_PREFIX, crate::platform_dir_name(&node.platform)));

        BuilderNode {
          name: format!("{}-{}", prefix, short_id()),
          platform: node.platform.clone(),
          namespace: node.namespace.clone(),
          driver_options: node.driver_options.clone(),
          state: NodeState::Absent,
        }
      })
      .collect();

    BuildxDriver::Kubernetes {
      builder: format!("{}-{}", BUILDER_PREFIX, short_id()),
      nodes,
      driver_image: config.driver_image.clone(),
      labels,
      config_file,
    }
  }

  pub fn is_kubernetes(&self) -> bool {
    matches!(self, BuildxDriver::Kubernetes { .. })
  }

  pub fn nodes(&self) -> &[BuilderNode] {
    match self {
      BuildxDriver::SingleHost { .. } => &[],
      BuildxDriver::Kubernetes { nodes, .. } => nodes,
    }
  }

  pub fn transition_all(&mut self, next: NodeState) -> Result<()> {
    if let BuildxDriver::Kubernetes { nodes, .. } = self {
      for node in nodes.iter_mut() {
        node.transition(next)?;
      }
    }

    Ok(())
  }

  pub fn create_commands(&self) -> Vec<String> {
    match self {
      BuildxDriver::SingleHost { config_file } => {
        let mut command = format!(
          "docker buildx create --use --buildkitd-flags {}",
          shell_quote(BUILDKITD_FLAGS)
        );
        if let Some(config) = config_file {
          command.push_str(&format!(" --config {}", config.display()));
        }
        vec![command]
      }
      BuildxDriver::Kubernetes {
        builder,
        nodes,
        driver_image,
        labels,
        config_file,
      } => nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
          let mut parts = vec![
            "docker buildx create".to_string(),
            format!("--buildkitd-flags {}", shell_quote(BUILDKITD_FLAGS)),
            format!("--name={}", builder),
            "--driver=kubernetes".to_string(),
            format!("--node={}", node.name),
          ];

          if !node.platform.is_empty() {
            parts.push(format!("--platform={}", node.platform));
          }
          if !node.namespace.is_empty() {
            parts.push(driver_opt("namespace", &node.namespace));
          }
          if let Some(image) = driver_image {
            parts.push(driver_opt("image", image));
          }
          for (key, value) in &node.driver_options {
            parts.push(driver_opt(key, value));
          }
          if !labels.is_empty() {
            let labels = labels
              .iter()
              .map(|(k, v)| format!("{}={}", k, v))
              .collect::<Vec<_>>()
              .join(",");
            parts.push(driver_opt("labels", &labels));
          }
          if let Some(config) = config_file {
            parts.push(format!("--config {}", config.display()));
          }

          parts.push(if i == 0 { "--use" } else { "--append" }.to_string());

          parts.join(" ")
        })
        .collect(),
    }
  }

  /// Kubernetes nodes only get their deployments and pods once the builder is
  /// bootstrapped; `buildx create` alone leaves them absent.
  pub fn bootstrap_command(&self) -> Option<String> {
    match self {
      BuildxDriver::SingleHost { .. } => None,
      BuildxDriver::Kubernetes { builder, .. } => {
        Some(format!("docker buildx inspect {} --bootstrap", builder))
      }
    }
  }

  /// Leave every node, then remove the builder.
  pub fn cleanup_commands(&self) -> Vec<String> {
    match self {
      BuildxDriver::SingleHost { .. } => vec![],
      BuildxDriver::Kubernetes { builder, nodes, .. } => nodes
        .iter()
        .map(|node| {
          format!(
            "docker buildx create --name={} --node={} --leave",
            builder, node.name
          )
        })
        .chain(std::iter::once(format!("docker buildx rm {}", builder)))
        .collect(),
    }
  }
}
