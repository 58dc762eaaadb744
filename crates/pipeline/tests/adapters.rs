use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use ci_runner::{CiCompleteEvent, CompletionEvent, Error};
use ci_runner_pipeline::{
  EventSink, HttpEventSink, HttpImageScanner, ImageScanRequest, ImageScanner,
};
use parking_lot::Mutex;
use std::{
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  time::Duration,
};

/// Answers with 500 until `failures` requests were seen.
struct Orchestrator {
  failures: usize,
  hits: AtomicUsize,
  received: Mutex<Vec<(Option<String>, serde_json::Value)>>,
}

impl Orchestrator {
  fn new(failures: usize) -> Arc<Self> {
    Arc::new(Orchestrator {
      failures,
      hits: AtomicUsize::new(0),
      received: Mutex::new(vec![]),
    })
  }
}

async fn record(
  State(state): State<Arc<Orchestrator>>,
  headers: HeaderMap,
  Json(body): Json<serde_json::Value>,
) -> StatusCode {
  let hit = state.hits.fetch_add(1, Ordering::SeqCst);

  let auth = headers
    .get("authorization")
    .and_then(|value| value.to_str().ok())
    .map(str::to_string);
  state.received.lock().push((auth, body));

  if hit < state.failures {
    StatusCode::INTERNAL_SERVER_ERROR
  } else {
    StatusCode::OK
  }
}

async fn serve(state: Arc<Orchestrator>) -> String {
  let router = Router::new()
    .route("/orchestrator/webhook/msg/ci", post(record))
    .route("/scanner/image", post(record))
    .with_state(state);

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });

  format!("http://{}", addr)
}

fn event() -> CompletionEvent {
  CompletionEvent::Ci(CiCompleteEvent {
    workflow_id: 42,
    docker_image: "reg.io/shop/api:abc".to_string(),
    ..Default::default()
  })
}

#[ci_runner_test::test]
async fn event_is_retried_until_accepted() {
  let orchestrator = Orchestrator::new(2);
  let url = serve(orchestrator.clone()).await;

  let sink = HttpEventSink::with_retries(&url, "t0k", 3, Duration::from_millis(5)).unwrap();
  sink.send(&event()).await.unwrap();

  assert_eq!(orchestrator.hits.load(Ordering::SeqCst), 3);

  let received = orchestrator.received.lock().clone();
  let (auth, body) = &received[2];
  assert_eq!(auth.as_deref(), Some("Bearer t0k"));
  assert_eq!(body["workflowId"], 42);
  assert_eq!(body["dockerImage"], "reg.io/shop/api:abc");
}

#[ci_runner_test::test]
async fn event_delivery_gives_up_after_retries() {
  let orchestrator = Orchestrator::new(usize::MAX);
  let url = serve(orchestrator.clone()).await;

  let sink = HttpEventSink::with_retries(&url, "", 3, Duration::from_millis(1)).unwrap();
  assert!(sink.send(&event()).await.is_err());

  assert_eq!(orchestrator.hits.load(Ordering::SeqCst), 4);
  assert_eq!(orchestrator.received.lock()[0].0, None);
}

#[ci_runner_test::test]
async fn image_scan_failure_is_scan_failed() {
  let orchestrator = Orchestrator::new(usize::MAX);
  let url = serve(orchestrator.clone()).await;

  let scanner = HttpImageScanner::new(&url, 2, Duration::from_millis(1)).unwrap();
  let request = ImageScanRequest {
    image: "reg.io/shop/api:abc".to_string(),
    image_digest: "sha256:feed".to_string(),
    pipeline_id: 4,
    ..Default::default()
  };

  let err = scanner.scan(&request).await.unwrap_err();

  assert!(matches!(err, Error::ScanFailed(_)));
  assert_eq!(orchestrator.hits.load(Ordering::SeqCst), 3);
  assert_eq!(orchestrator.received.lock()[0].1["imageDigest"], "sha256:feed");
}

#[ci_runner_test::test]
async fn image_scan_is_accepted() {
  let orchestrator = Orchestrator::new(0);
  let url = serve(orchestrator.clone()).await;

  let scanner = HttpImageScanner::new(&url, 2, Duration::from_millis(1)).unwrap();
  scanner.scan(&ImageScanRequest::default()).await.unwrap();

  assert_eq!(orchestrator.hits.load(Ordering::SeqCst), 1);
}
