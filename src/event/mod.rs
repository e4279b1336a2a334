//! Builder output events and the sinks they flow through.
//!
//! The builder child process reports everything it does as a stream of
//! JSON events, one per line, on stdout. The coordinator forwards those
//! events to the HTTP client and synthesizes a few of its own (debug
//! progress markers, terminal error messages).

pub mod json_sink;
pub mod recording;
pub mod relay;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sink::SinkError;

pub use json_sink::JsonSink;
pub use recording::RecordingSink;
pub use relay::{LineRelay, RelayStop, RelayWriter};

pub const STREAM_STDOUT: &str = "stdout";
pub const STREAM_STDERR: &str = "stderr";
pub const STREAM_DEBUG: &str = "debug";

/// One unit of program output, JSON-encoded on the wire with the field
/// names the builder emits. The timestamp is stamped at construction and
/// never rewritten downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Event {
    pub file: String,
    pub message: String,
    pub stream: String,
    pub timestamp: i64,
}

impl Event {
    pub fn new(file: impl Into<String>, stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            message: message.into(),
            stream: stream.into(),
            timestamp: now_nanos(),
        }
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Stream of events headed for the client.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn write(&self, events: &[Event]) -> Result<(), SinkError>;
}

/// Emits a debug-stream event. Failures are ignored; debug markers are
/// best-effort and must never abort the operation that emits them.
pub async fn debug(sink: &dyn EventSink, message: impl Into<String>) {
    let _ = sink.write(&[Event::new("", STREAM_DEBUG, message)]).await;
}
