use crate::{BuildCommandRunner, CommandSpec};
use base64::{engine::general_purpose::STANDARD, Engine};
use ci_runner::{Error, RegistryType, Result, WorkflowRequest};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
  pub username: String,
  pub password: String,
}

impl std::fmt::Debug for RegistryCredentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RegistryCredentials")
      .field("username", &self.username)
      .finish_non_exhaustive()
  }
}

/// Registry host of the request without scheme or trailing slash.
pub fn registry_host(request: &WorkflowRequest) -> String {
  request
    .docker_registry_url
    .trim_start_matches("https://")
    .trim_start_matches("http://")
    .trim_end_matches('/')
    .to_string()
}

/// Decodes an ECR authorization token (`base64("AWS:<password>")`).
pub fn decode_ecr_token(token: &str) -> Result<RegistryCredentials> {
  let decoded = STANDARD
    .decode(token.trim())
    .map_err(|err| Error::bad_request(format!("malformed ECR authorization token: {}", err)))?;
  let decoded = String::from_utf8(decoded)
    .map_err(|_| Error::bad_request("ECR authorization token is not UTF-8"))?;

  let (username, password) = decoded
    .split_once(':')
    .ok_or_else(|| Error::bad_request("ECR authorization token has no user part"))?;

  Ok(RegistryCredentials {
    username: username.to_string(),
    password: password.to_string(),
  })
}

fn ecr_token_command(request: &WorkflowRequest) -> CommandSpec {
  let mut command = CommandSpec::new(format!(
    "aws ecr get-authorization-token --region {} --output text --query 'authorizationData[0].authorizationToken'",
    request.aws_region
  ));

  if !request.access_key.is_empty() {
    command = command
      .env("AWS_ACCESS_KEY_ID", &request.access_key)
      .env("AWS_SECRET_ACCESS_KEY", &request.secret_key);
  }

  command
}

/// Credentials for the request's registry, `None` for anonymous access.
pub async fn registry_credentials(
  request: &WorkflowRequest,
  runner: &dyn BuildCommandRunner,
) -> Result<Option<RegistryCredentials>> {
  match request.docker_registry_type {
    RegistryType::Ecr => {
      let token = runner.output(&ecr_token_command(request)).await?;
      decode_ecr_token(&token).map(Some)
    }
    ref registry if registry.uses_json_key() => {
      let key: serde_json::Value = serde_json::from_str(&request.docker_password)
        .map_err(|err| Error::bad_request(format!("malformed service account key: {}", err)))?;

      if !key.is_object() {
        return Err(Error::bad_request(
          "malformed service account key: expected a JSON object",
        ));
      }

      Ok(Some(RegistryCredentials {
        username: "_json_key".to_string(),
        password: request.docker_password.clone(),
      }))
    }
    _ if request.docker_username.is_empty() => Ok(None),
    _ => Ok(Some(RegistryCredentials {
      username: request.docker_username.clone(),
      password: request.docker_password.clone(),
    })),
  }
}

pub fn login_command(host: &str, credentials: &RegistryCredentials) -> CommandSpec {
  CommandSpec::new(format!(
    "printf '%s' \"$REGISTRY_PASSWORD\" | docker login -u \"$REGISTRY_USERNAME\" --password-stdin {}",
    host
  ))
  .env("REGISTRY_USERNAME", &credentials.username)
  .env("REGISTRY_PASSWORD", &credentials.password)
}

pub async fn login(request: &WorkflowRequest, runner: &dyn BuildCommandRunner) -> Result<()> {
  let Some(credentials) = registry_credentials(request, runner).await? else {
    log::debug!("No registry credentials, skipping docker login");
    return Ok(());
  };

  let host = registry_host(request);
  runner
    .output(&login_command(&host, &credentials))
    .await
    .map_err(|err| Error::push_failed(format!("docker login to {} failed: {}", host, err)))?;

  log::info!("Logged in to {}", host);

  Ok(())
}

/// `docker push` with `retries` extra attempts.
pub async fn push_with_retry(
  runner: &dyn BuildCommandRunner,
  dest: &str,
  retries: u32,
  interval: Duration,
) -> Result<()> {
  let command = CommandSpec::new(format!("docker push {}", dest));
  let mut attempt = 0;

  loop {
    attempt += 1;

    match runner.run(&command, CancellationToken::new()).await {
      Ok(()) => return Ok(()),
      Err(err) if attempt <= retries => {
        log::warn!(
          "Push of {} failed (attempt {}/{}): {}",
          dest,
          attempt,
          retries + 1,
          err
        );
        tokio::time::sleep(interval).await;
      }
      Err(err) => {
        return Err(Error::push_failed(format!(
          "{} after {} attempts: {}",
          dest, attempt, err
        )))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[derive(Default)]
  struct Recorder {
    commands: Mutex<Vec<CommandSpec>>,
    failures: Mutex<u32>,
    output: String,
  }

  #[async_trait::async_trait]
  impl BuildCommandRunner for Recorder {
    async fn run(&self, command: &CommandSpec, _: CancellationToken) -> Result<()> {
      self.commands.lock().push(command.clone());
      let mut failures = self.failures.lock();
      if *failures > 0 {
        *failures -= 1;
        return Err(Error::command_failed(Some(1), "denied"));
      }
      Ok(())
    }

    async fn output(&self, command: &CommandSpec) -> Result<String> {
      self.commands.lock().push(command.clone());
      Ok(self.output.clone())
    }
  }

  #[test]
  fn test_decode_ecr_token() {
    let token = STANDARD.encode("AWS:secret-password");
    let credentials = decode_ecr_token(&token).unwrap();

    assert_eq!(credentials.username, "AWS");
    assert_eq!(credentials.password, "secret-password");
    assert!(!format!("{:?}", credentials).contains("secret-password"));
    assert!(decode_ecr_token("***").is_err());
  }

  #[ci_runner_test::test]
  async fn test_json_key_registries_fail_loudly() {
    let runner = Recorder::default();
    let request = WorkflowRequest {
      docker_registry_type: RegistryType::Gcr,
      docker_password: "{not json".to_string(),
      ..Default::default()
    };

    let err = registry_credentials(&request, &runner).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));

    let request = WorkflowRequest {
      docker_password: r#"{"type":"service_account"}"#.to_string(),
      ..request
    };
    let credentials = registry_credentials(&request, &runner).await.unwrap().unwrap();
    assert_eq!(credentials.username, "_json_key");
  }

  #[ci_runner_test::test]
  async fn test_login_keeps_password_off_the_command_line() {
    let runner = Recorder {
      output: STANDARD.encode("AWS:pw"),
      ..Default::default()
    };
    let request = WorkflowRequest {
      docker_registry_type: RegistryType::Ecr,
      docker_registry_url: "https://1.dkr.ecr.us-east-1.amazonaws.com/".to_string(),
      aws_region: "us-east-1".to_string(),
      ..Default::default()
    };

    login(&request, &runner).await.unwrap();

    let commands = runner.commands.lock();
    assert!(commands[0].script.starts_with("aws ecr get-authorization-token --region us-east-1"));
    assert!(commands[1]
      .script
      .ends_with("--password-stdin 1.dkr.ecr.us-east-1.amazonaws.com"));
    assert!(!commands[1].script.contains("pw"));
    assert_eq!(commands[1].env["REGISTRY_PASSWORD"], "pw");
  }

  #[ci_runner_test::test]
  async fn test_push_retries() {
    let runner = Recorder::default();
    *runner.failures.lock() = 2;

    push_with_retry(&runner, "reg/app:1", 2, Duration::from_millis(1))
      .await
      .unwrap();
    assert_eq!(runner.commands.lock().len(), 3);

    *runner.failures.lock() = 5;
    let err = push_with_retry(&runner, "reg/app:1", 1, Duration::from_millis(1))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::PushFailed(_)));
  }
}
