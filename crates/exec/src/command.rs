use crate::WorkflowLogger;
use ci_runner::{EnvironmentVariables, Error, Result};
use parking_lot::Mutex;
use std::{
  collections::VecDeque,
  path::Path,
  process::{ExitStatus, Stdio},
  sync::Arc,
  task::Waker,
};
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  process::{Child, Command as Cmd},
};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
  Stdout,
  Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Log {
  pub log_type: LogType,
  pub message: String,
}

impl Log {
  pub fn stdout(message: impl Into<String>) -> Self {
    Self {
      log_type: LogType::Stdout,
      message: message.into(),
    }
  }

  pub fn stderr(message: impl Into<String>) -> Self {
    Self {
      log_type: LogType::Stderr,
      message: message.into(),
    }
  }

  pub fn is_error(&self) -> bool {
    self.log_type == LogType::Stderr
  }
}

struct State {
  logs: VecDeque<Log>,
  exit_status: Option<ExitStatus>,
  cancelled: bool,
  waker: Option<Waker>,
}

impl State {
  fn wake(&mut self) {
    if let Some(waker) = self.waker.take() {
      waker.wake();
    }
  }
}

/// Output lines of a running command. Ends once the process has exited.
/// Dropping it kills the command's process group.
pub struct Receiver {
  state: Arc<Mutex<State>>,
  _guard: DropGuard,
}

impl Stream for Receiver {
  type Item = Log;

  fn poll_next(
    self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<Option<Self::Item>> {
    let mut state = self.state.lock();

    if let Some(log) = state.logs.pop_front() {
      return std::task::Poll::Ready(Some(log));
    }

    if state.exit_status.is_some() {
      return std::task::Poll::Ready(None);
    }

    state.waker = Some(cx.waker().clone());

    std::task::Poll::Pending
  }
}

impl Receiver {
  pub fn exit_status(&self) -> Option<ExitStatus> {
    self.state.lock().exit_status
  }

  pub fn is_cancelled(&self) -> bool {
    self.state.lock().cancelled
  }
}

pub struct Command {
  command: Cmd,
  display: String,
  cancellation: Option<CancellationToken>,
}

impl Command {
  /// Runs `cmd` through `sh -c`.
  pub fn new(cmd: impl Into<String>) -> Self {
    let cmd: String = cmd.into();
    let mut command = Cmd::new("sh");

    command.arg("-c").arg(&cmd).kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    Command {
      command,
      display: cmd,
      cancellation: None,
    }
  }

  pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.command.env(key.into(), value.into());

    self
  }

  pub fn envs(&mut self, envs: &EnvironmentVariables) -> &mut Self {
    self.command.envs(envs);

    self
  }

  pub fn dir(&mut self, dir: &Path) -> &mut Self {
    self.command.current_dir(dir);

    self
  }

  /// Kills the process group when `token` is cancelled.
  pub fn cancel_on(&mut self, token: CancellationToken) -> &mut Self {
    self.cancellation = Some(token);

    self
  }

  pub fn display(&self) -> &str {
    &self.display
  }

  /// Runs to completion and returns the trimmed stdout.
  pub async fn exec(&mut self) -> Result<String> {
    let output = self.command.output().await.map_err(|err| {
      Error::internal_runtime_error(format!("Failed to spawn child process: {}", err))
    })?;

    if output.status.success() {
      return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    Err(Error::command_failed(output.status.code(), stderr))
  }

  pub fn run(&mut self) -> Result<Receiver> {
    let mut child = self
      .command
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|err| {
        Error::internal_runtime_error(format!("Failed to spawn child process: {}", err))
      })?;

    let state = Arc::new(Mutex::new(State {
      logs: VecDeque::new(),
      exit_status: None,
      cancelled: false,
      waker: None,
    }));

    let cancellation = self
      .cancellation
      .as_ref()
      .map(CancellationToken::child_token)
      .unwrap_or_default();

    let receiver = Receiver {
      state: state.clone(),
      _guard: cancellation.clone().drop_guard(),
    };

    let out = child.stdout.take().ok_or_else(|| {
      Error::internal_runtime_error("Failed to get stdout from child process")
    })?;
    let err = child.stderr.take().ok_or_else(|| {
      Error::internal_runtime_error("Failed to get stderr from child process")
    })?;

    tokio::task::spawn(async move {
      let mut lines = BufReader::new(out).lines();
      let mut errors = BufReader::new(err).lines();
      let mut stdout_done = false;
      let mut stderr_done = false;

      let add_log = |log: Log| {
        let mut state = state.lock();
        state.logs.push_back(log);
        state.wake();
      };

      while !(stdout_done && stderr_done) {
        tokio::select! {
          line = lines.next_line(), if !stdout_done => {
            match line {
              Ok(Some(line)) => add_log(Log::stdout(line)),
              Ok(None) => stdout_done = true,
              Err(err) => {
                add_log(Log::stderr(err.to_string()));
                stdout_done = true;
              }
            }
          }
          line = errors.next_line(), if !stderr_done => {
            match line {
              Ok(Some(line)) => add_log(Log::stderr(line)),
              Ok(None) => stderr_done = true,
              Err(err) => {
                add_log(Log::stderr(err.to_string()));
                stderr_done = true;
              }
            }
          }
          _ = cancellation.cancelled() => {
            log::trace!("Killing cancelled child process");
            kill_process_group(&mut child);
            state.lock().cancelled = true;
            break;
          }
        }
      }

      let status = match child.wait().await {
        Ok(status) => status,
        Err(err) => {
          log::error!("Failed to wait for child process: {}", err);
          failed_status()
        }
      };

      let mut state = state.lock();
      state.exit_status = Some(status);
      state.wake();
    });

    Ok(receiver)
  }

  /// Streams every output line into `logger` and fails on a non-zero exit.
  pub async fn run_logged(&mut self, logger: &WorkflowLogger) -> Result<()> {
    let mut receiver = self.run()?;

    while let Some(log) = receiver.next().await {
      logger.line(&log.message);
    }

    if receiver.is_cancelled() {
      return Err(Error::command_failed(None, "command was cancelled"));
    }

    match receiver.exit_status() {
      Some(status) if status.success() => Ok(()),
      Some(status) => Err(Error::command_failed(
        status.code(),
        format!("`{}` exited with {}", first_word(&self.display), status),
      )),
      None => Err(Error::command_failed(None, "command did not report an exit status")),
    }
  }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
  use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
  };

  if let Some(pid) = child.id() {
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
      Ok(()) | Err(Errno::ESRCH) => return,
      Err(err) => log::warn!("Failed to kill process group {}: {}", pid, err),
    }
  }

  if let Err(err) = child.start_kill() {
    log::error!("Failed to kill child process: {}", err);
  }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
  if let Err(err) = child.start_kill() {
    log::error!("Failed to kill child process: {}", err);
  }
}

fn first_word(cmd: &str) -> &str {
  cmd.split_whitespace().next().unwrap_or(cmd)
}

#[cfg(unix)]
fn failed_status() -> ExitStatus {
  use std::os::unix::process::ExitStatusExt;
  ExitStatus::from_raw(1 << 8)
}

#[cfg(not(unix))]
fn failed_status() -> ExitStatus {
  use std::os::windows::process::ExitStatusExt;
  ExitStatus::from_raw(1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[ci_runner_test::test(unix)]
  async fn test_command() {
    let mut cmd = Command::new("echo hello");
    let mut receiver = cmd.run().unwrap();

    let mut logs = vec![];

    while let Some(log) = receiver.next().await {
      logs.push(log);
    }

    assert_eq!(logs, vec![Log::stdout("hello")]);
    assert!(receiver.exit_status().unwrap().success());
  }

  #[ci_runner_test::test(unix)]
  async fn test_both_streams_are_drained() {
    let mut cmd = Command::new("echo out; echo err 1>&2; sleep 0.1; echo late");
    let mut receiver = cmd.run().unwrap();

    let mut logs = vec![];
    while let Some(log) = receiver.next().await {
      logs.push(log);
    }

    assert!(logs.contains(&Log::stderr("err")));
    assert!(logs.contains(&Log::stdout("late")));
  }

  #[ci_runner_test::test(unix)]
  async fn test_exec() {
    assert_eq!(Command::new("echo hi").exec().await.unwrap(), "hi");

    let err = Command::new("echo nope 1>&2; exit 3").exec().await.unwrap_err();
    assert_eq!(err, Error::command_failed(Some(3), "nope"));
  }

  #[ci_runner_test::test(unix)]
  async fn test_cancel_kills_process() {
    let token = CancellationToken::new();
    let mut cmd = Command::new("sleep 30");
    cmd.cancel_on(token.clone());

    let logger = WorkflowLogger::stdout();
    let started = std::time::Instant::now();

    let cancel = tokio::spawn(async move {
      tokio::time::sleep(std::time::Duration::from_millis(100)).await;
      token.cancel();
    });

    let res = cmd.run_logged(&logger).await;
    cancel.await.unwrap();

    assert_eq!(res, Err(Error::command_failed(None, "command was cancelled")));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
  }

  /// Whether `pid` still runs; zombies waiting for a reaper count as gone.
  #[cfg(target_os = "linux")]
  fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
      Ok(stat) => stat
        .rsplit(')')
        .next()
        .map(|rest| !rest.trim_start().starts_with('Z'))
        .unwrap_or(false),
      Err(_) => false,
    }
  }

  #[cfg(target_os = "linux")]
  async fn background_pid(dir: &Path) -> u32 {
    let pid_file = dir.join("pid");
    for _ in 0..200 {
      if let Ok(pid) = std::fs::read_to_string(&pid_file) {
        if let Ok(pid) = pid.trim().parse() {
          return pid;
        }
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("background process never started");
  }

  #[cfg(target_os = "linux")]
  async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..200 {
      if !is_running(pid) {
        return true;
      }
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
  }

  #[cfg(target_os = "linux")]
  #[ci_runner_test::test]
  async fn test_cancel_kills_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let mut cmd = Command::new("sleep 30 & echo $! > pid.tmp && mv pid.tmp pid; wait");
    cmd.dir(dir.path()).cancel_on(token.clone());

    let logger = WorkflowLogger::stdout();
    let run = tokio::spawn(async move { cmd.run_logged(&logger).await });

    let pid = background_pid(dir.path()).await;
    assert!(is_running(pid));

    token.cancel();
    assert!(run.await.unwrap().is_err());
    assert!(wait_until_gone(pid).await);
  }

  #[cfg(target_os = "linux")]
  #[ci_runner_test::test]
  async fn test_dropping_receiver_kills_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new("sleep 30 & echo $! > pid.tmp && mv pid.tmp pid; wait");
    cmd.dir(dir.path());

    let receiver = cmd.run().unwrap();
    let pid = background_pid(dir.path()).await;
    assert!(is_running(pid));

    drop(receiver);
    assert!(wait_until_gone(pid).await);
  }
}
