use crate::RegistryCredentials;
use ci_runner::{Error, Result};
use reqwest::{
  header::{HeaderMap, ACCEPT, WWW_AUTHENTICATE},
  StatusCode,
};
use serde::Deserialize;
use std::{collections::HashMap, path::Path};

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DIGEST_HEADER: &str = "docker-content-digest";
const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
  application/vnd.docker.distribution.manifest.list.v2+json, \
  application/vnd.docker.distribution.manifest.v2+json, \
  application/vnd.oci.image.manifest.v1+json";

/// `containerimage.digest` of a buildx `--metadata-file`, `None` when the
/// file is missing or carries no digest.
pub async fn digest_from_metadata(path: &Path) -> Result<Option<String>> {
  let content = match tokio::fs::read_to_string(path).await {
    Ok(content) => content,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(err) => return Err(err.into()),
  };

  let metadata: serde_json::Value = serde_json::from_str(&content).map_err(|err| {
    Error::digest_extract_failed(format!("invalid buildx metadata {}: {}", path.display(), err))
  })?;

  Ok(
    metadata
      .get("containerimage.digest")
      .and_then(|digest| digest.as_str())
      .filter(|digest| !digest.is_empty())
      .map(|digest| digest.to_string()),
  )
}

/// Digest printed by `docker pull`.
pub fn digest_from_pull_output(output: &str) -> Option<String> {
  output
    .lines()
    .map(str::trim)
    .find(|line| line.starts_with("Digest: sha256:"))
    .map(|line| line.trim_start_matches("Digest: ").to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
  pub registry: String,
  pub repository: String,
  pub reference: String,
}

impl ImageReference {
  pub fn parse(image: &str) -> Result<Self> {
    let image = image
      .trim()
      .trim_start_matches("https://")
      .trim_start_matches("http://");

    if image.is_empty() {
      return Err(Error::digest_extract_failed("empty image reference"));
    }

    let (registry, rest) = match image.split_once('/') {
      Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
        (host.to_string(), rest.to_string())
      }
      _ => (DOCKER_HUB_REGISTRY.to_string(), image.to_string()),
    };

    let (repository, reference) = if let Some((repository, digest)) = rest.split_once('@') {
      (repository.to_string(), digest.to_string())
    } else {
      match rest.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository.to_string(), tag.to_string()),
        _ => (rest.clone(), "latest".to_string()),
      }
    };

    let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
      format!("library/{}", repository)
    } else {
      repository
    };

    Ok(ImageReference {
      registry,
      repository,
      reference,
    })
  }

  pub fn manifest_url(&self, insecure: bool) -> String {
    format!(
      "{}://{}/v2/{}/manifests/{}",
      if insecure { "http" } else { "https" },
      self.registry,
      self.repository,
      self.reference
    )
  }
}

/// Parameters of a `WWW-Authenticate: Bearer realm=..,service=..,scope=..`
/// challenge.
pub fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
  let params = header.trim().strip_prefix("Bearer ")?;
  let mut values = HashMap::new();

  let mut rest = params.trim();
  while !rest.is_empty() {
    let (key, after) = rest.split_once('=')?;
    let after = after.trim_start();

    let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
      let end = quoted.find('"')?;
      (&quoted[..end], &quoted[end + 1..])
    } else {
      match after.find(',') {
        Some(end) => (&after[..end], &after[end..]),
        None => (after, ""),
      }
    };

    values.insert(key.trim().to_lowercase(), value.to_string());
    rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
  }

  Some(values)
}

#[derive(Deserialize)]
struct TokenResponse {
  #[serde(default)]
  token: Option<String>,
  #[serde(default)]
  access_token: Option<String>,
}

fn api_error(err: reqwest::Error) -> Error {
  Error::digest_extract_failed(format!("registry api: {}", err))
}

/// Reads manifest digests through the registry v2 API.
#[derive(Clone)]
pub struct RegistryClient {
  http: reqwest::Client,
}

impl RegistryClient {
  pub fn new(insecure: bool) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static(MANIFEST_TYPES));

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .danger_accept_invalid_certs(insecure)
      .build()
      .map_err(api_error)?;

    Ok(RegistryClient { http })
  }

  pub async fn manifest_digest(
    &self,
    image: &ImageReference,
    credentials: Option<&RegistryCredentials>,
    insecure: bool,
  ) -> Result<String> {
    let url = image.manifest_url(insecure);

    let mut request = self.http.head(&url);
    if let Some(credentials) = credentials {
      request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }
    let mut response = request.send().await.map_err(api_error)?;

    if response.status() == StatusCode::UNAUTHORIZED {
      let challenge = response
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_challenge);

      if let Some(challenge) = challenge {
        let token = self.bearer_token(&challenge, credentials).await?;
        response = self
          .http
          .head(&url)
          .bearer_auth(token)
          .send()
          .await
          .map_err(api_error)?;
      }
    }

    let response = response.error_for_status().map_err(api_error)?;

    response
      .headers()
      .get(DIGEST_HEADER)
      .and_then(|value| value.to_str().ok())
      .map(|digest| digest.to_string())
      .ok_or_else(|| Error::digest_extract_failed(format!("{} returned no digest header", url)))
  }

  async fn bearer_token(
    &self,
    challenge: &HashMap<String, String>,
    credentials: Option<&RegistryCredentials>,
  ) -> Result<String> {
    let realm = challenge
      .get("realm")
      .ok_or_else(|| Error::digest_extract_failed("bearer challenge without realm"))?;

    let query: Vec<(&str, &String)> = ["service", "scope"]
      .into_iter()
      .filter_map(|key| challenge.get(key).map(|value| (key, value)))
      .collect();

    let mut request = self.http.get(realm).query(&query);
    if let Some(credentials) = credentials {
      request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let token: TokenResponse = request
      .send()
      .await
      .map_err(api_error)?
      .error_for_status()
      .map_err(api_error)?
      .json()
      .await
      .map_err(api_error)?;

    token
      .token
      .or(token.access_token)
      .ok_or_else(|| Error::digest_extract_failed("token endpoint returned no token"))
  }
}
