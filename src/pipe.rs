//! Response recorders — the sinks the executors hand to the proxy.
//!
//! Two shapes:
//!
//! - [`BufferedRecorder`] captures the entire upstream response in memory
//!   for the non-streaming executor to transform afterwards.
//! - [`StreamingRecorder`] wraps the write half of an in-memory byte pipe:
//!   it captures the status and headers, fires a one-shot `headers_ready`
//!   signal on the first write, and forwards all body bytes into the pipe.
//!   The read half is consumed concurrently by the streaming translator.
//!
//! The pipe is `tokio::io::duplex`: both ends close independently, the
//! reader sees EOF when the writer is dropped, and a write into a pipe
//! whose reader is gone fails — which is exactly the teardown story the
//! streaming executor relies on.

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWriteExt as _, DuplexStream};
use tokio::sync::oneshot;

use crate::proxy::ResponseSink;

/// Initial body buffer size for buffered responses; grows as needed.
const INITIAL_BODY_CAPACITY: usize = 4 * 1024;

/// Default in-flight window of the streaming pipe.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Status + headers captured at the head of a response.
#[derive(Debug, Clone)]
pub struct RecordedHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

// ─── Buffered ────────────────────────────────────────────────────────────────

/// Captures the whole upstream response in memory.
#[derive(Debug)]
pub struct BufferedRecorder {
    pub head: Option<RecordedHead>,
    pub body: BytesMut,
}

impl BufferedRecorder {
    pub fn new() -> Self {
        Self { head: None, body: BytesMut::with_capacity(INITIAL_BODY_CAPACITY) }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|h| h.status)
    }
}

impl Default for BufferedRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseSink for BufferedRecorder {
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> std::io::Result<()> {
        self.head = Some(RecordedHead { status, headers: headers.clone() });
        Ok(())
    }

    async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()> {
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

// ─── Streaming ───────────────────────────────────────────────────────────────

/// Write half of the streaming pipe, plus the one-shot head signal.
pub struct StreamingRecorder {
    writer: DuplexStream,
    head_tx: Option<oneshot::Sender<RecordedHead>>,
}

/// Build the pipe: the recorder goes to the proxy task, the reader to the
/// translator, and the receiver resolves once the head is known.
pub fn streaming_pipe() -> (StreamingRecorder, DuplexStream, oneshot::Receiver<RecordedHead>) {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (head_tx, head_rx) = oneshot::channel();
    (StreamingRecorder { writer, head_tx: Some(head_tx) }, reader, head_rx)
}

impl StreamingRecorder {
    fn signal_head(&mut self, head: RecordedHead) {
        // Second signal is a no-op; a dropped receiver just means the
        // foreground already gave up.
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(head);
        }
    }
}

#[async_trait]
impl ResponseSink for StreamingRecorder {
    async fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) -> std::io::Result<()> {
        self.signal_head(RecordedHead { status, headers: headers.clone() });
        Ok(())
    }

    async fn write_body(&mut self, chunk: Bytes) -> std::io::Result<()> {
        // A body write without a prior head means the proxy skipped
        // write_head; unblock the waiter with a bare 200 rather than hang.
        self.signal_head(RecordedHead { status: StatusCode::OK, headers: HeaderMap::new() });
        self.writer.write_all(&chunk).await
    }
}
