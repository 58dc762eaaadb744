use ci_runner::{CompletionEvent, Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::{sync::Arc, time::Duration};

pub const EVENT_RETRIES: u32 = 3;

/// Delivers the completion event of a workflow.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
  async fn send(&self, event: &CompletionEvent) -> Result<()>;
}

struct ClientInner {
  http: reqwest::Client,
  base_url: String,
  retries: u32,
  retry_delay: Duration,
}

/// Posts events as JSON to the orchestrator.
#[derive(Clone)]
pub struct HttpEventSink {
  inner: Arc<ClientInner>,
}

impl HttpEventSink {
  pub fn new(base_url: impl Into<String>, token: &str) -> Result<Self> {
    Self::with_retries(base_url, token, EVENT_RETRIES, Duration::from_secs(1))
  }

  pub fn with_retries(
    base_url: impl Into<String>,
    token: &str,
    retries: u32,
    retry_delay: Duration,
  ) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if !token.is_empty() {
      let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|err| Error::bad_request(format!("invalid orchestrator token: {}", err)))?;
      headers.insert(AUTHORIZATION, bearer);
    }

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(event_error)?;

    Ok(HttpEventSink {
      inner: Arc::new(ClientInner {
        http,
        base_url: base_url.into().trim_end_matches('/').to_string(),
        retries,
        retry_delay,
      }),
    })
  }

  async fn post(&self, event: &CompletionEvent) -> Result<()> {
    let url = format!("{}{}", self.inner.base_url, event.path());

    self
      .inner
      .http
      .post(url)
      .json(event)
      .send()
      .await
      .map_err(event_error)?
      .error_for_status()
      .map_err(event_error)?;

    Ok(())
  }
}

fn event_error(err: reqwest::Error) -> Error {
  Error::internal_runtime_error(format!("event delivery: {}", err))
}

#[async_trait::async_trait]
impl EventSink for HttpEventSink {
  async fn send(&self, event: &CompletionEvent) -> Result<()> {
    let mut attempt = 0;

    loop {
      match self.post(event).await {
        Ok(()) => {
          log::info!("Sent completion event to {}", event.path());
          return Ok(());
        }
        Err(err) if attempt < self.inner.retries => {
          attempt += 1;
          log::warn!(
            "Failed to send completion event (attempt {}/{}): {}",
            attempt,
            self.inner.retries,
            err
          );
          tokio::time::sleep(self.inner.retry_delay).await;
        }
        Err(err) => return Err(err),
      }
    }
  }
}

/// Writes the event to the process log. Used when no orchestrator endpoint
/// is configured.
pub struct LogEventSink;

#[async_trait::async_trait]
impl EventSink for LogEventSink {
  async fn send(&self, event: &CompletionEvent) -> Result<()> {
    let json = serde_json::to_string(event)
      .map_err(|err| Error::internal_runtime_error(format!("event serialization: {}", err)))?;

    log::info!("Completion event {}: {}", event.path(), json);

    Ok(())
  }
}
