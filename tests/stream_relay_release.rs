//! Streaming relay release guarantees
//!
//! Every exit path (EOF, upstream error, client disconnect, task abort) must
//! drop the upstream stream exactly once and run release hooks exactly once.

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use gatehouse::{
    backends::ByteStream,
    config::Config,
    handlers::{self, AppState},
    metrics::Metrics,
    shedder::FixedProbe,
    streaming::{RelayReport, RelayTermination, StreamRelaySession},
};
use serde_json::json;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method};

/// Upstream stream that counts how many times it is dropped
struct Tracked {
    inner: ByteStream,
    drops: Arc<AtomicUsize>,
}

impl Stream for Tracked {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn tracked(inner: ByteStream) -> (ByteStream, Arc<AtomicUsize>) {
    let drops = Arc::new(AtomicUsize::new(0));
    let upstream = Tracked {
        inner,
        drops: drops.clone(),
    };
    (upstream.boxed(), drops)
}

fn chunks(parts: &[&'static str]) -> ByteStream {
    let items: Vec<Result<Bytes, io::Error>> =
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
    stream::iter(items).boxed()
}

fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce(&RelayReport) + Send + 'static {
    let counter = counter.clone();
    move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

async fn collect(mut receiver: mpsc::Receiver<Result<Bytes, io::Error>>) -> (String, bool) {
    let mut text = String::new();
    let mut aborted = false;
    while let Some(item) = receiver.recv().await {
        match item {
            Ok(bytes) => text.push_str(std::str::from_utf8(&bytes).unwrap()),
            Err(_) => aborted = true,
        }
    }
    (text, aborted)
}

#[tokio::test]
async fn test_eof_releases_once_and_forwards_everything() {
    let metrics = Metrics::new().unwrap();
    let crab = "🦀".as_bytes();
    let (upstream, drops) = tracked(
        stream::iter(vec![
            Ok(Bytes::from_static(b"data: one\n\n")),
            Ok(Bytes::copy_from_slice(&crab[..2])),
            Ok(Bytes::copy_from_slice(&crab[2..])),
        ])
        .boxed(),
    );
    let hooks = Arc::new(AtomicUsize::new(0));
    let (sink, receiver) = mpsc::channel(8);

    let session = StreamRelaySession::new("local", upstream, metrics.clone())
        .on_release(counting_hook(&hooks));
    let (report, (text, aborted)) = tokio::join!(session.relay(sink), collect(receiver));

    assert_eq!(report.termination, RelayTermination::Completed);
    assert_eq!(text, "data: one\n\n🦀");
    assert!(!aborted);
    assert_eq!(report.chunks, 3);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert_eq!(
        metrics.stream_termination_count("local", RelayTermination::Completed),
        1
    );
}

#[tokio::test]
async fn test_upstream_error_emits_error_event_and_aborts() {
    let metrics = Metrics::new().unwrap();
    let failing = stream::iter(vec![
        Ok(Bytes::from_static(b"data: partial\n\n")),
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        Ok(Bytes::from_static(b"data: never\n\n")),
    ])
    .boxed();
    let (upstream, drops) = tracked(failing);
    let hooks = Arc::new(AtomicUsize::new(0));
    let (sink, receiver) = mpsc::channel(8);

    let session = StreamRelaySession::new("local", upstream, metrics.clone())
        .on_release(counting_hook(&hooks));
    let (report, (text, aborted)) = tokio::join!(session.relay(sink), collect(receiver));

    assert_eq!(report.termination, RelayTermination::UpstreamFailed);
    assert!(report.error.is_some());
    assert!(text.starts_with("data: partial\n\n"));
    assert!(text.contains("event: error\n"));
    assert!(!text.contains("never"));
    assert!(aborted);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stalled_upstream_fails_after_idle_timeout() {
    let metrics = Metrics::new().unwrap();
    // Headers and one chunk arrive, then the upstream goes silent
    let stalled = chunks(&["data: first\n\n"]).chain(stream::pending()).boxed();
    let (upstream, drops) = tracked(stalled);
    let hooks = Arc::new(AtomicUsize::new(0));
    let (sink, receiver) = mpsc::channel(8);

    let session = StreamRelaySession::new("local", upstream, metrics.clone())
        .idle_timeout(Duration::from_millis(50))
        .on_release(counting_hook(&hooks));
    let (report, (text, aborted)) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(session.relay(sink), collect(receiver)) },
    )
    .await
    .expect("idle timeout should end the relay");

    assert_eq!(report.termination, RelayTermination::UpstreamFailed);
    assert!(report.error.unwrap().to_string().contains("no data from upstream"));
    assert!(text.starts_with("data: first\n\n"));
    assert!(text.contains("event: error\n"));
    assert!(aborted);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert_eq!(
        metrics.stream_termination_count("local", RelayTermination::UpstreamFailed),
        1
    );
}

#[tokio::test]
async fn test_downstream_disconnect_stops_reading_upstream() {
    let metrics = Metrics::new().unwrap();
    // One chunk, then an upstream that never finishes on its own
    let endless = chunks(&["data: first\n\n"]).chain(stream::pending()).boxed();
    let (upstream, drops) = tracked(endless);
    let hooks = Arc::new(AtomicUsize::new(0));
    let (sink, mut receiver) = mpsc::channel(8);

    let session = StreamRelaySession::new("local", upstream, metrics.clone())
        .on_release(counting_hook(&hooks));
    let relay = tokio::spawn(session.relay(sink));

    let first = receiver.recv().await.unwrap().unwrap();
    assert_eq!(&first[..], b"data: first\n\n");
    drop(receiver);

    let report = tokio::time::timeout(Duration::from_secs(2), relay)
        .await
        .expect("relay should stop once the client is gone")
        .unwrap();
    assert_eq!(report.termination, RelayTermination::DownstreamClosed);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_aborted_relay_task_still_releases() {
    let metrics = Metrics::new().unwrap();
    let (upstream, drops) = tracked(stream::pending().boxed());
    let hooks = Arc::new(AtomicUsize::new(0));
    let (sink, _receiver) = mpsc::channel(8);

    let session = StreamRelaySession::new("local", upstream, metrics.clone())
        .on_release(counting_hook(&hooks));
    let relay = tokio::spawn(session.relay(sink));
    tokio::time::sleep(Duration::from_millis(20)).await;
    relay.abort();
    assert!(relay.await.unwrap_err().is_cancelled());

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert_eq!(
        metrics.stream_termination_count("local", RelayTermination::Cancelled),
        1
    );
}

#[tokio::test]
async fn test_dropped_session_never_started_releases() {
    let metrics = Metrics::new().unwrap();
    let (upstream, drops) = tracked(chunks(&["unused"]));
    let hooks = Arc::new(AtomicUsize::new(0));

    let session = StreamRelaySession::new("cloud", upstream, metrics).on_release(counting_hook(&hooks));
    drop(session);

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streamed_http_response_releases_admission() {
    let local = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string("data: {\"delta\":\"hi\"}\n\ndata: [DONE]\n\n"),
        )
        .mount(&local)
        .await;

    let config = Config::from_str(&format!(
        r#"
[server]
host = "127.0.0.1"
port = 8080

[[backends]]
name = "local"
base_url = "{}"
api = "openai"

[[backends]]
name = "cloud"
base_url = "http://127.0.0.1:9"
api = "anthropic"

[routing]
prefer_local = true
local_backend = "local"
cloud_backend = "cloud"
"#,
        local.uri()
    ))
    .unwrap();
    let state = AppState::new(Arc::new(config), Arc::new(FixedProbe::idle())).unwrap();
    let app = handlers::router(state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"stream": true, "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).ends_with("data: [DONE]\n\n"));
    assert_eq!(state.shedder().active_requests(), 0);
    assert_eq!(
        state
            .metrics()
            .stream_termination_count("local", RelayTermination::Completed),
        1
    );
}
