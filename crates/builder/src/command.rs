use ci_runner::{DockerBuildConfig, WorkflowRequest};
use std::collections::BTreeMap;

/// Prefix of build values that are looked up in the process environment.
pub const ENV_VALUE_PREFIX: &str = "$devtron_env_";

/// Turns a build-arg or build-option value into a shell word.
///
/// `$devtron_env_NAME` resolves to the value of `NAME` in `env`, anything
/// else is used verbatim. Values already wrapped in quotes are kept as they
/// are.
pub fn resolve_build_value(value: &str, env: &BTreeMap<String, String>) -> String {
  if let Some(name) = value.strip_prefix(ENV_VALUE_PREFIX) {
    let resolved = env.get(name).cloned().unwrap_or_default();
    return format!("\"{}\"", resolved);
  }

  let quoted = value.len() >= 2
    && ((value.starts_with('"') && value.ends_with('"'))
      || (value.starts_with('\'') && value.ends_with('\'')));

  if quoted {
    value.to_string()
  } else {
    format!("\"{}\"", value)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
  Min,
  Max,
}

impl CacheMode {
  pub fn from_use_min(use_min: bool) -> Self {
    if use_min {
      CacheMode::Min
    } else {
      CacheMode::Max
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheMode::Min => "min",
      CacheMode::Max => "max",
    }
  }
}

/// Builder for `docker build` / `docker buildx build` command lines.
///
/// Flags are rendered in a fixed order regardless of the order the setters
/// were called in.
#[derive(Debug, Clone, Default)]
pub struct BuildCommand {
  buildx: bool,
  no_cache: bool,
  build_args: Vec<(String, String)>,
  options: Vec<(String, String)>,
  dockerfile: Option<String>,
  network_host: bool,
  platforms: Vec<String>,
  push: bool,
  cache_from: Vec<String>,
  cache_to: Vec<String>,
  metadata_file: Option<String>,
  tag: Option<String>,
  context: String,
}

impl BuildCommand {
  pub fn docker() -> Self {
    BuildCommand {
      context: ".".to_string(),
      ..Default::default()
    }
  }

  pub fn buildx() -> Self {
    BuildCommand {
      buildx: true,
      ..BuildCommand::docker()
    }
  }

  /// Build args, options, dockerfile and context of a docker build config.
  pub fn from_config(
    buildx: bool,
    config: &DockerBuildConfig,
    env: &BTreeMap<String, String>,
  ) -> Self {
    let mut command = if buildx {
      BuildCommand::buildx()
    } else {
      BuildCommand::docker()
    };

    for (key, value) in &config.args {
      command = command.build_arg(key, resolve_build_value(value, env));
    }

    for (key, value) in &config.docker_build_options {
      command = command.option(key, resolve_build_value(value, env));
    }

    if !config.dockerfile_path.is_empty() {
      command = command.dockerfile(&config.dockerfile_path);
    }

    if !config.build_context.is_empty() {
      command = command.context(&config.build_context);
    }

    command.network_host()
  }

  pub fn is_buildx(&self) -> bool {
    self.buildx
  }

  pub fn no_cache(mut self, no_cache: bool) -> Self {
    self.no_cache = no_cache;
    self
  }

  pub fn build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.build_args.push((key.into(), value.into()));
    self
  }

  pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.options.push((key.into(), value.into()));
    self
  }

  pub fn dockerfile(mut self, path: impl Into<String>) -> Self {
    self.dockerfile = Some(path.into());
    self
  }

  pub fn network_host(mut self) -> Self {
    self.network_host = true;
    self
  }

  pub fn platforms(mut self, platforms: &[String]) -> Self {
    self.platforms = platforms.to_vec();
    self
  }

  pub fn push(mut self) -> Self {
    self.push = true;
    self
  }

  pub fn cache_from(mut self, src: impl AsRef<str>) -> Self {
    self
      .cache_from
      .push(format!("--cache-from=type=local,src={}", src.as_ref()));
    self
  }

  pub fn cache_to(mut self, dest: impl AsRef<str>, mode: CacheMode) -> Self {
    self.cache_to.push(format!(
      "--cache-to=type=local,dest={},mode={}",
      dest.as_ref(),
      mode.as_str()
    ));
    self
  }

  pub fn without_cache_export(mut self) -> Self {
    self.cache_to.clear();
    self
  }

  pub fn metadata_file(mut self, path: impl Into<String>) -> Self {
    self.metadata_file = Some(path.into());
    self
  }

  pub fn tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }

  pub fn context(mut self, context: impl Into<String>) -> Self {
    self.context = context.into();
    self
  }

  pub fn render(&self) -> String {
    let mut parts: Vec<String> = vec![if self.buildx {
      "docker buildx build".to_string()
    } else {
      "docker build".to_string()
    }];

    if self.no_cache {
      parts.push("--no-cache".to_string());
    }

    for (key, value) in &self.build_args {
      parts.push(format!("--build-arg {}={}", key, value));
    }

    for (key, value) in &self.options {
      parts.push(format!("--{}={}", key, value));
    }

    if let Some(dockerfile) = &self.dockerfile {
      parts.push(format!("-f {}", dockerfile));
    }

    if self.network_host {
      parts.push("--network host".to_string());
    }

    if self.buildx {
      if !self.platforms.is_empty() {
        parts.push(format!("--platform {}", self.platforms.join(",")));
      }
      if self.push {
        parts.push("--push".to_string());
      }
      parts.extend(self.cache_to.iter().cloned());
      parts.extend(self.cache_from.iter().cloned());
      if let Some(metadata) = &self.metadata_file {
        parts.push(format!("--metadata-file {}", metadata));
      }
    }

    if let Some(tag) = &self.tag {
      parts.push(format!("-t {}", tag));
    }

    parts.push(self.context.clone());

    parts.join(" ")
  }
}

impl std::fmt::Display for BuildCommand {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.render())
  }
}

/// `--no-cache` only matters when a previous cache is actually mounted.
pub fn should_invalidate_cache(request: &WorkflowRequest) -> bool {
  request.cache_invalidate && request.is_pvc_mounted
}

/// `docker tag <repo>:latest <dest>` after a plain docker build.
pub fn tag_command(repository: &str, dest: &str) -> String {
  format!("docker tag {}:latest {}", repository, dest)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_build_value() {
    let env = BTreeMap::from([("NPM_TOKEN".to_string(), "abc".to_string())]);

    assert_eq!(resolve_build_value("$devtron_env_NPM_TOKEN", &env), "\"abc\"");
    assert_eq!(resolve_build_value("$devtron_env_MISSING", &env), "\"\"");
    assert_eq!(resolve_build_value("plain", &env), "\"plain\"");
    assert_eq!(resolve_build_value("'quoted'", &env), "'quoted'");
    assert_eq!(resolve_build_value("\"dq\"", &env), "\"dq\"");
  }

  #[test]
  fn test_flag_order_is_fixed() {
    let command = BuildCommand::docker()
      .tag("repo:latest")
      .context("./app")
      .network_host()
      .dockerfile("Dockerfile")
      .option("target", "\"prod\"")
      .build_arg("A", "\"1\"")
      .no_cache(true);

    assert_eq!(
      command.render(),
      "docker build --no-cache --build-arg A=\"1\" --target=\"prod\" -f Dockerfile --network host -t repo:latest ./app"
    );
  }

  #[test]
  fn test_from_config() {
    let config = DockerBuildConfig {
      dockerfile_path: "./Dockerfile".to_string(),
      build_context: "./".to_string(),
      args: BTreeMap::from([
        ("B".to_string(), "2".to_string()),
        ("A".to_string(), "$devtron_env_VERSION".to_string()),
      ]),
      ..Default::default()
    };
    let env = BTreeMap::from([("VERSION".to_string(), "1.2".to_string())]);

    let command = BuildCommand::from_config(false, &config, &env).tag("r:latest");

    assert_eq!(
      command.render(),
      "docker build --build-arg A=\"1.2\" --build-arg B=\"2\" -f ./Dockerfile --network host -t r:latest ./"
    );
  }

  #[test]
  fn test_buildx_flags() {
    let command = BuildCommand::buildx()
      .platforms(&["linux/amd64".to_string(), "linux/arm64".to_string()])
      .push()
      .cache_to("/cache", CacheMode::Max)
      .cache_from("/cache-old")
      .metadata_file("/buildx/manifest.json")
      .tag("reg/app:1");

    assert_eq!(
      command.render(),
      "docker buildx build --platform linux/amd64,linux/arm64 --push --cache-to=type=local,dest=/cache,mode=max --cache-from=type=local,src=/cache-old --metadata-file /buildx/manifest.json -t reg/app:1 ."
    );

    assert!(!command.without_cache_export().render().contains("--cache-to"));
  }

  #[test]
  fn test_tag_command() {
    assert_eq!(
      tag_command("app", "reg.io/app:abc"),
      "docker tag app:latest reg.io/app:abc"
    );
  }
}
