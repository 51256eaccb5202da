//! Streaming relay
//!
//! A `StreamRelaySession` owns one upstream byte stream and forwards it to the
//! client through an `mpsc` channel as decoded UTF-8 text. The upstream handle
//! is released exactly once, on every exit path:
//!
//! - upstream EOF: trailing bytes are flushed, then release
//! - upstream error, or no upstream bytes within the idle timeout: an SSE
//!   `error` event is sent, the downstream body is aborted, then release
//! - downstream gone (receiver dropped or a send fails): reading stops, then
//!   release
//! - the relay future itself dropped: `Drop` runs the same release path
//!
//! Release drops the upstream stream (cancelling any in-flight read), records
//! termination metrics and runs the registered release hooks.

use crate::backends::ByteStream;
use crate::error::BackendError;
use crate::metrics::{Metrics, log_recording_failure};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

/// Chunks sent to the client; an `Err` aborts the response body
pub type RelaySink = mpsc::Sender<Result<Bytes, io::Error>>;

/// How a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTermination {
    /// Upstream reached EOF and everything was forwarded
    Completed,
    /// Upstream failed after streaming began
    UpstreamFailed,
    /// The client went away
    DownstreamClosed,
    /// The session was dropped before the relay finished
    Cancelled,
}

impl RelayTermination {
    /// Convert termination mode to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayTermination::Completed => "completed",
            RelayTermination::UpstreamFailed => "upstream_failed",
            RelayTermination::DownstreamClosed => "downstream_closed",
            RelayTermination::Cancelled => "cancelled",
        }
    }
}

/// Summary handed to release hooks
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub backend: String,
    pub termination: RelayTermination,
    /// Bytes of decoded text forwarded to the client
    pub bytes_relayed: usize,
    /// Upstream chunks read
    pub chunks: usize,
    pub error: Option<BackendError>,
}

type ReleaseHook = Box<dyn FnOnce(&RelayReport) + Send>;

/// Incremental UTF-8 decoder
///
/// Multi-byte sequences split across chunk boundaries are held back until the
/// next chunk completes them. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `pending + chunk` as is complete
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if let Ok(valid) =
                        std::str::from_utf8(&self.pending[start..start + valid_up_to])
                    {
                        out.push_str(valid);
                    }
                    match e.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid_up_to + invalid_len;
                        }
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            start += valid_up_to;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flush whatever is left; an incomplete trailing sequence becomes U+FFFD
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    /// Bytes held back waiting for the rest of a character
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

pub struct StreamRelaySession {
    backend: String,
    upstream: Option<ByteStream>,
    decoder: Utf8Decoder,
    hooks: Vec<ReleaseHook>,
    idle_timeout: Option<Duration>,
    bytes_relayed: usize,
    chunks: usize,
    released: bool,
    metrics: Metrics,
}

impl StreamRelaySession {
    pub fn new(backend: impl Into<String>, upstream: ByteStream, metrics: Metrics) -> Self {
        Self {
            backend: backend.into(),
            upstream: Some(upstream),
            decoder: Utf8Decoder::new(),
            hooks: Vec::new(),
            idle_timeout: None,
            bytes_relayed: 0,
            chunks: 0,
            released: false,
            metrics,
        }
    }

    /// Register a callback to run once when the session releases
    pub fn on_release(mut self, hook: impl FnOnce(&RelayReport) + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Fail the stream when the upstream sends nothing for `limit`
    pub fn idle_timeout(mut self, limit: Duration) -> Self {
        self.idle_timeout = Some(limit);
        self
    }

    /// Forward the upstream stream into `sink` until it ends, fails, or the
    /// client goes away, then release
    pub async fn relay(mut self, sink: RelaySink) -> RelayReport {
        let (termination, error) = self.pump(&sink).await;
        self.release(termination, error)
    }

    async fn pump(&mut self, sink: &RelaySink) -> (RelayTermination, Option<BackendError>) {
        let idle = self.idle_timeout;
        let Some(upstream) = self.upstream.as_mut() else {
            return (RelayTermination::Completed, None);
        };

        loop {
            let read = tokio::select! {
                biased;
                _ = sink.closed() => return (RelayTermination::DownstreamClosed, None),
                read = read_next(upstream, idle) => read,
            };
            let next = match read {
                Ok(next) => next,
                Err(limit) => {
                    let error = BackendError::StreamIo {
                        backend: self.backend.clone(),
                        bytes_relayed: self.bytes_relayed,
                        message: format!(
                            "no data from upstream for {}ms",
                            limit.as_millis()
                        ),
                    };
                    abort_downstream(sink, &error).await;
                    return (RelayTermination::UpstreamFailed, Some(error));
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    self.chunks += 1;
                    let text = self.decoder.push(&chunk);
                    if text.is_empty() {
                        continue;
                    }
                    let len = text.len();
                    if sink.send(Ok(Bytes::from(text))).await.is_err() {
                        return (RelayTermination::DownstreamClosed, None);
                    }
                    self.bytes_relayed += len;
                }
                Some(Err(e)) => {
                    let error = BackendError::StreamIo {
                        backend: self.backend.clone(),
                        bytes_relayed: self.bytes_relayed,
                        message: e.to_string(),
                    };
                    abort_downstream(sink, &error).await;
                    return (RelayTermination::UpstreamFailed, Some(error));
                }
                None => {
                    let tail = self.decoder.finish();
                    if !tail.is_empty() {
                        let len = tail.len();
                        if sink.send(Ok(Bytes::from(tail))).await.is_err() {
                            return (RelayTermination::DownstreamClosed, None);
                        }
                        self.bytes_relayed += len;
                    }
                    return (RelayTermination::Completed, None);
                }
            }
        }
    }

    /// The single finalize path. Later calls are no-ops.
    fn release(
        &mut self,
        termination: RelayTermination,
        error: Option<BackendError>,
    ) -> RelayReport {
        let report = RelayReport {
            backend: self.backend.clone(),
            termination,
            bytes_relayed: self.bytes_relayed,
            chunks: self.chunks,
            error,
        };
        if self.released {
            return report;
        }
        self.released = true;

        // Dropping the stream cancels any outstanding upstream read
        drop(self.upstream.take());

        match termination {
            RelayTermination::Completed => tracing::debug!(
                backend = %self.backend,
                bytes_relayed = self.bytes_relayed,
                chunks = self.chunks,
                "Stream relay completed"
            ),
            RelayTermination::UpstreamFailed => {
                tracing::warn!(
                    backend = %self.backend,
                    bytes_relayed = self.bytes_relayed,
                    error = ?report.error,
                    "Upstream failed mid-stream; client stream aborted"
                );
                self.metrics.mid_stream_failure(&self.backend);
            }
            RelayTermination::DownstreamClosed | RelayTermination::Cancelled => tracing::info!(
                backend = %self.backend,
                bytes_relayed = self.bytes_relayed,
                termination = termination.as_str(),
                "Stream relay stopped early; upstream released"
            ),
        }
        log_recording_failure(
            &self.metrics,
            "record_stream_termination",
            self.metrics
                .record_stream_termination(&self.backend, termination),
        );

        for hook in self.hooks.drain(..) {
            hook(&report);
        }
        report
    }
}

impl Drop for StreamRelaySession {
    fn drop(&mut self) {
        if !self.released {
            self.release(RelayTermination::Cancelled, None);
        }
    }
}

/// Next upstream item, or `Err(limit)` when none arrives within `idle`
async fn read_next(
    upstream: &mut ByteStream,
    idle: Option<Duration>,
) -> Result<Option<Result<Bytes, io::Error>>, Duration> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, upstream.next())
            .await
            .map_err(|_| limit),
        None => Ok(upstream.next().await),
    }
}

/// Send the SSE error event, then abort the client body
async fn abort_downstream(sink: &RelaySink, error: &BackendError) {
    // Best effort: the client may already be gone
    let _ = sink.send(Ok(sse_error_event(error))).await;
    let _ = sink.send(Err(io::Error::other(error.to_string()))).await;
}

/// SSE `error` event in the Anthropic streaming format
fn sse_error_event(error: &BackendError) -> Bytes {
    let payload = json!({
        "type": "error",
        "error": {
            "type": "api_error",
            "message": error.to_string(),
        }
    });
    Bytes::from(format!("event: error\ndata: {}\n\n", payload))
}
