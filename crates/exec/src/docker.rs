use crate::{command::Command, utils::shell_quote};
use std::collections::BTreeMap;

/// `docker run` invocation. Environment values travel through the docker
/// CLI's own environment (`-e KEY`) so they never appear on the command line.
#[derive(Debug, Clone)]
pub struct Docker {
  pub image: String,
  pub name: Option<String>,
  pub environments: BTreeMap<String, String>,
  pub working_dir: Option<String>,
  pub entrypoint: Option<String>,
  pub volumes: Vec<(String, String)>,
  pub ports: BTreeMap<u16, u16>,
  pub network: Option<String>,
  pub auto_remove: bool,
  pub command: Vec<String>,
}

impl Docker {
  pub fn new(image: impl Into<String>) -> Self {
    Self {
      image: image.into(),
      name: None,
      environments: BTreeMap::new(),
      working_dir: None,
      entrypoint: None,
      volumes: Vec::new(),
      ports: BTreeMap::new(),
      network: None,
      auto_remove: true,
      command: Vec::new(),
    }
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn auto_remove(mut self, auto_remove: bool) -> Self {
    self.auto_remove = auto_remove;
    self
  }

  pub fn environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.environments.insert(key.into(), value.into());
    self
  }

  pub fn working_dir(mut self, working_dir: impl Into<String>) -> Self {
    self.working_dir = Some(working_dir.into());
    self
  }

  pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
    self.entrypoint = Some(entrypoint.into());
    self
  }

  pub fn volume(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
    self.volumes.push((from.into(), to.into()));
    self
  }

  pub fn port(mut self, host: u16, container: u16) -> Self {
    self.ports.insert(host, container);
    self
  }

  pub fn network(mut self, network: impl Into<String>) -> Self {
    self.network = Some(network.into());
    self
  }

  pub fn command(mut self, command: impl Into<String>) -> Self {
    self.command.push(command.into());
    self
  }

  pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
    self.command.extend(args);
    self
  }

  pub fn generate_docker_command(&self) -> String {
    let mut docker_command: Vec<String> = vec!["docker".to_string(), "run".to_string()];

    if self.auto_remove {
      docker_command.push("--rm".to_string());
    }

    if let Some(network) = &self.network {
      docker_command.push(format!("--network={}", network));
    }

    for (host, container) in &self.ports {
      docker_command.push("-p".to_string());
      docker_command.push(format!("{}:{}", host, container));
    }

    for (from, to) in &self.volumes {
      docker_command.push("-v".to_string());
      docker_command.push(shell_quote(&format!("{}:{}", from, to)));
    }

    for key in self.environments.keys() {
      docker_command.push("-e".to_string());
      docker_command.push(key.to_string());
    }

    if let Some(working_dir) = &self.working_dir {
      docker_command.push("-w".to_string());
      docker_command.push(shell_quote(working_dir));
    }

    if let Some(entrypoint) = &self.entrypoint {
      docker_command.push("--entrypoint".to_string());
      docker_command.push(shell_quote(entrypoint));
    }

    if let Some(name) = &self.name {
      docker_command.push("--name".to_string());
      docker_command.push(name.to_string());
    }

    docker_command.push(self.image.clone());

    for part in &self.command {
      docker_command.push(shell_quote(part));
    }

    docker_command.join(" ")
  }
}

impl From<Docker> for Command {
  fn from(docker: Docker) -> Self {
    let mut command = Command::new(docker.generate_docker_command());

    for (key, value) in docker.environments {
      command.env(key, value);
    }

    command
  }
}

#[cfg(test)]
mod tests {
  use super::Docker;

  #[test]
  fn test_generate_docker_command() {
    let command = Docker::new("alpine:3.19")
      .name("ci-step-1_lint")
      .environment("TOKEN", "s3cr3t")
      .environment("APP", "web")
      .working_dir("/output")
      .entrypoint("/bin/sh")
      .volume("/ci-runner/process/output", "/output")
      .port(8080, 80)
      .command("-c")
      .args(vec!["echo $APP > /output/out.env".to_string()])
      .generate_docker_command();

    assert_eq!(
      command,
      "docker run --rm -p 8080:80 -v '/ci-runner/process/output:/output' -e APP -e TOKEN -w '/output' --entrypoint '/bin/sh' --name ci-step-1_lint alpine:3.19 '-c' 'echo $APP > /output/out.env'"
    );
    assert!(!command.contains("s3cr3t"));
  }

  #[test]
  fn test_network_and_no_auto_remove() {
    let command = Docker::new("busybox")
      .network("host")
      .auto_remove(false)
      .generate_docker_command();

    assert_eq!(command, "docker run --network=host busybox");
  }
}
