use crate::{RecoveryManager, RecoveryMetrics};
use axum::{
  extract::State,
  http::{header, StatusCode},
  response::IntoResponse,
  routing::{get, post},
  Json, Router,
};
use serde_json::json;
use std::{future::Future, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn router(manager: RecoveryManager) -> Router {
  Router::new()
    .route("/recovery/status", get(status))
    .route("/recovery/start", post(start))
    .route("/recovery/stop", post(stop))
    .route("/metrics", get(metrics))
    .with_state(manager)
}

async fn status(State(manager): State<RecoveryManager>) -> Json<RecoveryMetrics> {
  Json(manager.metrics())
}

async fn start(State(manager): State<RecoveryManager>) -> impl IntoResponse {
  if manager.start() {
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" })))
  } else {
    (
      StatusCode::CONFLICT,
      Json(json!({ "status": "already running" })),
    )
  }
}

async fn stop(State(manager): State<RecoveryManager>) -> impl IntoResponse {
  manager.stop();
  Json(json!({ "status": "stopping" }))
}

async fn metrics(State(manager): State<RecoveryManager>) -> impl IntoResponse {
  (
    [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
    render_prometheus(&manager.metrics()),
  )
}

fn metric(output: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
  output.push_str(&format!("# HELP {} {}\n", name, help));
  output.push_str(&format!("# TYPE {} {}\n", name, kind));
  output.push_str(&format!("{} {}\n", name, value));
}

/// Prometheus text exposition of the recovery counters.
pub fn render_prometheus(metrics: &RecoveryMetrics) -> String {
  let mut output = String::new();

  metric(
    &mut output,
    "scan_recovery_pending",
    "gauge",
    "Scans found running when recovery started",
    metrics.total_pending,
  );
  metric(
    &mut output,
    "scan_recovery_processed_total",
    "counter",
    "Scans re-dispatched",
    metrics.processed,
  );
  metric(
    &mut output,
    "scan_recovery_recovered_total",
    "counter",
    "Scans marked completed",
    metrics.recovered,
  );
  metric(
    &mut output,
    "scan_recovery_failed_total",
    "counter",
    "Scans that failed or ran out of attempts",
    metrics.failed,
  );
  metric(
    &mut output,
    "scan_recovery_running",
    "gauge",
    "Whether a recovery cycle is in progress",
    u8::from(metrics.is_running),
  );

  if let Some(time) = metrics.last_processed_time {
    metric(
      &mut output,
      "scan_recovery_last_processed_timestamp_seconds",
      "gauge",
      "When the last scan finished",
      time.timestamp(),
    );
  }

  output
}

/// Serves `router` until `shutdown` is cancelled, then gives in-flight
/// requests `grace` to finish.
pub async fn serve(
  addr: SocketAddr,
  manager: RecoveryManager,
  shutdown: CancellationToken,
  grace: Duration,
) -> std::io::Result<()> {
  let listener = TcpListener::bind(addr).await?;
  log::info!("Scanner listening on {}", listener.local_addr()?);

  let app = router(manager.clone());
  let signal = shutdown.clone();
  let server = tokio::spawn(async move {
    axum::serve(listener, app)
      .with_graceful_shutdown(async move { signal.cancelled().await })
      .await
  });

  shutdown.cancelled().await;
  log::info!("Shutting down scanner");
  manager.stop();

  match tokio::time::timeout(grace, server).await {
    Ok(Ok(result)) => result,
    Ok(Err(err)) => Err(std::io::Error::new(std::io::ErrorKind::Other, err)),
    Err(_) => {
      log::warn!("Server did not stop within {}s", grace.as_secs());
      Ok(())
    }
  }
}

/// Resolves on ctrl-c or SIGTERM.
pub fn shutdown_signal() -> impl Future<Output = ()> {
  async {
    let ctrl_c = async {
      if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
      }
    };

    #[cfg(unix)]
    let terminate = async {
      match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut signal) => {
          signal.recv().await;
        }
        Err(err) => {
          log::error!("Failed to listen for SIGTERM: {}", err);
          std::future::pending::<()>().await;
        }
      }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
      _ = ctrl_c => {},
      _ = terminate => {},
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_render_prometheus() {
    let metrics = RecoveryMetrics {
      total_pending: 4,
      processed: 3,
      recovered: 2,
      failed: 1,
      last_processed_time: chrono::Utc.timestamp_opt(1_700_000_000, 0).single(),
      ..Default::default()
    };

    let text = render_prometheus(&metrics);

    assert!(text.contains("# TYPE scan_recovery_processed_total counter\n"));
    assert!(text.contains("scan_recovery_pending 4\n"));
    assert!(text.contains("scan_recovery_recovered_total 2\n"));
    assert!(text.contains("scan_recovery_running 0\n"));
    assert!(text.contains("scan_recovery_last_processed_timestamp_seconds 1700000000\n"));
  }
}
