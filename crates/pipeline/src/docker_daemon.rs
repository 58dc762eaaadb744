use ci_runner::{Error, RegistryConnection, Result, WorkflowRequest};
use ci_runner_builder::{registry_host, BuildCommandRunner, CommandSpec};
use parking_lot::Mutex;
use std::{
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

/// Lifecycle of the docker daemon the build talks to.
#[async_trait::async_trait]
pub trait DockerDaemon: Send + Sync {
  async fn start(&self, request: &WorkflowRequest) -> Result<()>;

  async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DockerdConfig {
  pub socket: String,
  pub start_timeout: Duration,
  pub certs_dir: PathBuf,
  pub log_file: PathBuf,
  pub poll_interval: Duration,
  pub stop_retries: u32,
}

impl DockerdConfig {
  pub fn new(socket: impl Into<String>, start_timeout: Duration) -> Self {
    DockerdConfig {
      socket: socket.into(),
      start_timeout,
      certs_dir: PathBuf::from("/etc/docker/certs.d"),
      log_file: PathBuf::from("/var/log/dockerd.log"),
      poll_interval: Duration::from_secs(1),
      stop_retries: 30,
    }
  }
}

/// Runs `dockerd` in the background of the runner's pod.
pub struct Dockerd {
  runner: Arc<dyn BuildCommandRunner>,
  config: DockerdConfig,
  pid: Mutex<Option<u32>>,
}

impl Dockerd {
  pub fn new(runner: Arc<dyn BuildCommandRunner>, config: DockerdConfig) -> Self {
    Dockerd {
      runner,
      config,
      pid: Mutex::new(None),
    }
  }

  /// `dockerd` in the background, echoing its pid.
  pub fn start_command(&self, request: &WorkflowRequest) -> CommandSpec {
    let mut script = format!("dockerd --host={}", self.config.socket);

    if request.docker_connection == RegistryConnection::Insecure {
      script.push_str(&format!(" --insecure-registry {}", registry_host(request)));
    }

    script.push_str(&format!(
      " > {} 2>&1 & echo $!",
      self.config.log_file.to_string_lossy()
    ));

    CommandSpec::new(script)
  }

  async fn write_registry_cert(&self, request: &WorkflowRequest) -> Result<()> {
    if request.docker_connection != RegistryConnection::SecureWithCert || request.docker_cert.is_empty()
    {
      return Ok(());
    }

    let dir = self.config.certs_dir.join(registry_host(request));
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join("ca.crt"), &request.docker_cert).await?;

    Ok(())
  }

  async fn wait_until_ready(&self) -> Result<()> {
    let started = Instant::now();
    let info = CommandSpec::new("docker info");

    loop {
      match self.runner.output(&info).await {
        Ok(_) => {
          log::info!(
            "Docker daemon is ready after {}",
            humantime::format_duration(Duration::from_secs(started.elapsed().as_secs()))
          );
          return Ok(());
        }
        Err(err) if started.elapsed() >= self.config.start_timeout => {
          return Err(Error::internal_runtime_error(format!(
            "docker daemon did not start within {}: {}",
            humantime::format_duration(self.config.start_timeout),
            err
          )));
        }
        Err(err) => {
          log::trace!("Docker daemon not ready yet: {}", err);
          tokio::time::sleep(self.config.poll_interval).await;
        }
      }
    }
  }
}

#[async_trait::async_trait]
impl DockerDaemon for Dockerd {
  async fn start(&self, request: &WorkflowRequest) -> Result<()> {
    self.write_registry_cert(request).await?;

    let output = self.runner.output(&self.start_command(request)).await?;
    let pid = output
      .lines()
      .last()
      .and_then(|line| line.trim().parse::<u32>().ok())
      .ok_or_else(|| {
        Error::internal_runtime_error(format!("unexpected dockerd start output `{}`", output))
      })?;

    log::info!("Started docker daemon with pid {}", pid);
    *self.pid.lock() = Some(pid);

    self.wait_until_ready().await
  }

  async fn stop(&self) -> Result<()> {
    let Some(pid) = self.pid.lock().take() else {
      return Ok(());
    };

    let stop_containers = CommandSpec::new("docker ps -q | xargs -r docker stop");
    if let Err(err) = self.runner.output(&stop_containers).await {
      log::warn!("Failed to stop running containers: {}", err);
    }

    self
      .runner
      .output(&CommandSpec::new(format!("kill -TERM {}", pid)))
      .await?;

    let ps = CommandSpec::new("docker ps");
    for _ in 0..self.config.stop_retries {
      if self.runner.output(&ps).await.is_err() {
        log::info!("Docker daemon stopped");
        return Ok(());
      }
      tokio::time::sleep(self.config.poll_interval).await;
    }

    log::warn!(
      "Docker daemon {} still answers after {} checks",
      pid,
      self.config.stop_retries
    );

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};
  use tokio_util::sync::CancellationToken;

  #[derive(Default)]
  struct FakeShell {
    commands: Mutex<Vec<String>>,
    stopped: AtomicBool,
  }

  #[async_trait::async_trait]
  impl BuildCommandRunner for FakeShell {
    async fn run(&self, command: &CommandSpec, _: CancellationToken) -> Result<()> {
      self.commands.lock().push(command.script.clone());
      Ok(())
    }

    async fn output(&self, command: &CommandSpec) -> Result<String> {
      self.commands.lock().push(command.script.clone());

      if command.script.starts_with("dockerd") {
        return Ok("42".to_string());
      }
      if command.script.starts_with("kill") {
        self.stopped.store(true, Ordering::SeqCst);
      }
      if command.script == "docker ps" && self.stopped.load(Ordering::SeqCst) {
        return Err(Error::command_failed(Some(1), "cannot connect"));
      }

      Ok(String::new())
    }
  }

  fn dockerd(shell: Arc<FakeShell>, certs_dir: PathBuf) -> Dockerd {
    let mut config = DockerdConfig::new("unix:///var/run/docker.sock", Duration::from_secs(1));
    config.certs_dir = certs_dir;
    config.log_file = PathBuf::from("/tmp/dockerd.log");
    config.poll_interval = Duration::from_millis(1);

    Dockerd::new(shell, config)
  }

  #[ci_runner_test::test]
  async fn test_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let shell = Arc::new(FakeShell::default());
    let daemon = dockerd(shell.clone(), dir.path().to_path_buf());

    let request = WorkflowRequest {
      docker_registry_url: "http://reg.local:5000".to_string(),
      docker_connection: RegistryConnection::Insecure,
      ..Default::default()
    };

    daemon.start(&request).await.unwrap();
    daemon.stop().await.unwrap();
    // a second stop is a no-op
    daemon.stop().await.unwrap();

    let commands = shell.commands.lock().clone();
    assert_eq!(
      commands,
      vec![
        "dockerd --host=unix:///var/run/docker.sock --insecure-registry reg.local:5000 > /tmp/dockerd.log 2>&1 & echo $!",
        "docker info",
        "docker ps -q | xargs -r docker stop",
        "kill -TERM 42",
        "docker ps",
      ]
    );
  }

  #[ci_runner_test::test]
  async fn test_registry_cert_is_written() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = dockerd(Arc::new(FakeShell::default()), dir.path().to_path_buf());

    let request = WorkflowRequest {
      docker_registry_url: "https://reg.local".to_string(),
      docker_connection: RegistryConnection::SecureWithCert,
      docker_cert: "-----BEGIN CERTIFICATE-----".to_string(),
      ..Default::default()
    };

    daemon.start(&request).await.unwrap();

    let cert = std::fs::read_to_string(dir.path().join("reg.local").join("ca.crt")).unwrap();
    assert_eq!(cert, "-----BEGIN CERTIFICATE-----");
  }
}
