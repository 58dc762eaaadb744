use base64::{engine::general_purpose::STANDARD, Engine};
use ci_runner::{Error, GitMaterial, GitSourceType, Result};
use ci_runner_builder::{BuildCommandRunner, CommandSpec};
use ci_runner_exec::shell_quote;
use std::{path::Path, sync::Arc};

#[async_trait::async_trait]
pub trait GitCheckout: Send + Sync {
  /// Clones `material` into `dir` and checks out its commit.
  async fn checkout(&self, material: &GitMaterial, dir: &Path) -> Result<()>;
}

/// Checks out sources with the `git` CLI.
pub struct GitCli {
  runner: Arc<dyn BuildCommandRunner>,
}

impl GitCli {
  pub fn new(runner: Arc<dyn BuildCommandRunner>) -> Self {
    GitCli { runner }
  }

  async fn run(&self, command: CommandSpec) -> Result<()> {
    self
      .runner
      .run(&command, Default::default())
      .await
      .map_err(|err| Error::internal_runtime_error(format!("git failed: {}", err)))
  }
}

/// `Authorization` header value for password (or token) auth.
pub fn basic_auth_header(user_name: &str, password: &str) -> String {
  format!(
    "Authorization: Basic {}",
    STANDARD.encode(format!("{}:{}", user_name, password))
  )
}

/// The revision to check out: the commit when one is known, otherwise the
/// branch or tag the material tracks.
pub fn checkout_target(material: &GitMaterial) -> String {
  if !material.commit_hash.is_empty() {
    return material.commit_hash.clone();
  }

  match material.source_type {
    GitSourceType::SourceTypeTagAny => format!("tags/{}", material.source_value),
    _ => material.source_value.clone(),
  }
}

fn with_auth(command: String, material: &GitMaterial, key_file: Option<&Path>) -> CommandSpec {
  let options = &material.git_options;

  if let Some(key_file) = key_file {
    return CommandSpec::new(command).env(
      "GIT_SSH_COMMAND",
      format!(
        "ssh -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        shell_quote(&key_file.to_string_lossy())
      ),
    );
  }

  if !options.password.is_empty() {
    // The header stays in the environment so it never shows up in a logged
    // command line.
    return CommandSpec::new(format!(
      "git -c http.extraHeader=\"$GIT_AUTH_HEADER\" {}",
      command.trim_start_matches("git ")
    ))
    .env(
      "GIT_AUTH_HEADER",
      basic_auth_header(&options.user_name, &options.password),
    );
  }

  CommandSpec::new(command)
}

pub fn checkout_commands(
  material: &GitMaterial,
  dir: &Path,
  key_file: Option<&Path>,
) -> Vec<CommandSpec> {
  let dir = shell_quote(&dir.to_string_lossy());

  let mut commands = vec![
    with_auth(
      format!(
        "git clone --no-checkout {} {}",
        shell_quote(&material.git_repository),
        dir
      ),
      material,
      key_file,
    ),
    with_auth(
      format!("git -C {} fetch --tags origin", dir),
      material,
      key_file,
    ),
    CommandSpec::new(format!(
      "git -C {} checkout --force {}",
      dir,
      shell_quote(&checkout_target(material))
    )),
  ];

  if material.fetch_submodules {
    commands.push(with_auth(
      format!("git -C {} submodule update --init --recursive", dir),
      material,
      key_file,
    ));
  }

  commands
}

#[async_trait::async_trait]
impl GitCheckout for GitCli {
  async fn checkout(&self, material: &GitMaterial, dir: &Path) -> Result<()> {
    log::info!(
      "Checking out {} ({}) into {}",
      material.git_repository,
      checkout_target(material),
      dir.display()
    );

    let parent = dir.parent().unwrap_or(dir);
    tokio::fs::create_dir_all(parent).await?;

    let key_file = if material.git_options.ssh_private_key.is_empty() {
      None
    } else {
      let path = parent.join(format!(".ssh-key-{}", material.material_name));
      write_private_key(&path, &material.git_options.ssh_private_key).await?;
      Some(path)
    };

    for command in checkout_commands(material, dir, key_file.as_deref()) {
      self.run(command).await?;
    }

    if let Some(path) = key_file {
      if let Err(err) = tokio::fs::remove_file(&path).await {
        log::warn!("Failed to remove ssh key {}: {}", path.display(), err);
      }
    }

    Ok(())
  }
}

async fn write_private_key(path: &Path, key: &str) -> Result<()> {
  let mut content = key.to_string();
  if !content.ends_with('\n') {
    content.push('\n');
  }

  tokio::fs::write(path, content).await?;

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
  }

  Ok(())
}
