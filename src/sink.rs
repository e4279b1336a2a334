//! Byte-level output plumbing shared by the event sinks and the worker:
//! the `ByteSink` seam over chunked HTTP bodies and in-memory buffers, and
//! the budget-enforcing `LimitedWriter` wrapper.

use std::{
    convert::Infallible,
    sync::Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("write limit exceeded")]
    LimitExceeded,
    #[error("stream closed")]
    Closed,
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for raw response bytes. Implementations must be safe to share
/// across tasks; writes are whole-buffer (no partial writes).
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write(&self, buf: &[u8]) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Feeds a chunked HTTP response body. The receiving half is handed to
/// `Body::from_stream`; a failed send means the client is gone.
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Result<Bytes, Infallible>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ByteSink for ChannelSink {
    async fn write(&self, buf: &[u8]) -> Result<(), SinkError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(Bytes::copy_from_slice(buf)))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Accumulates written bytes in memory. Used for builder stderr capture.
#[derive(Default)]
pub struct BufferSink {
    buf: Mutex<Vec<u8>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }
}

#[async_trait]
impl ByteSink for BufferSink {
    async fn write(&self, buf: &[u8]) -> Result<(), SinkError> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }
}

/// Callback wrapper that runs the wrapped closure at most once, no matter
/// how many call sites race on it.
pub struct OnceCallback {
    inner: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OnceCallback {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(f))),
        }
    }

    pub fn call(&self) {
        let f = self.inner.lock().unwrap().take();
        if let Some(f) = f {
            f();
        }
    }
}

/// Enforces a total byte budget on a downstream sink.
///
/// Each write is admitted in full or rejected in full; truncation would break
/// the line framing the event relay depends on. Every attempted write counts
/// against the budget. The overflow callback fires at most once across the
/// writer's lifetime, including across repeated rejected writes.
pub struct LimitedWriter {
    inner: std::sync::Arc<dyn ByteSink>,
    limit: usize,
    written: Mutex<usize>,
    on_overflow: OnceCallback,
}

impl LimitedWriter {
    pub fn new(
        inner: std::sync::Arc<dyn ByteSink>,
        limit: usize,
        on_overflow: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            inner,
            limit,
            written: Mutex::new(0),
            on_overflow: OnceCallback::new(on_overflow),
        }
    }
}

#[async_trait]
impl ByteSink for LimitedWriter {
    async fn write(&self, buf: &[u8]) -> Result<(), SinkError> {
        {
            let mut written = self.written.lock().unwrap();
            if *written + buf.len() > self.limit {
                *written = self.limit;
                drop(written);
                self.on_overflow.call();
                return Err(SinkError::LimitExceeded);
            }
            if buf.is_empty() {
                return Ok(());
            }
            *written += buf.len();
        }
        self.inner.write(buf).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.flush().await
    }
}
