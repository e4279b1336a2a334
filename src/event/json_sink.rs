use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    event::{Event, EventSink, STREAM_DEBUG},
    sink::{ByteSink, SinkError},
};

/// Serializes events to the downstream writer as one JSON object per line.
///
/// Concurrent writers are serialized by an internal lock so the bytes of
/// different events never interleave. The writer is flushed after every
/// batch, even when a write in the batch failed.
pub struct JsonSink {
    writer: Arc<dyn ByteSink>,
    filter_debug: bool,
    lock: Mutex<()>,
}

impl JsonSink {
    pub fn new(writer: Arc<dyn ByteSink>, filter_debug: bool) -> Self {
        Self {
            writer,
            filter_debug,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventSink for JsonSink {
    async fn write(&self, events: &[Event]) -> Result<(), SinkError> {
        let _guard = self.lock.lock().await;

        let mut batch_err = None;
        for event in events {
            if self.filter_debug && event.stream == STREAM_DEBUG {
                continue;
            }
            let mut line = match serde_json::to_vec(event) {
                Ok(line) => line,
                Err(err) => {
                    batch_err = Some(SinkError::from(err));
                    break;
                }
            };
            line.push(b'\n');
            if let Err(err) = self.writer.write(&line).await {
                batch_err = Some(err);
                break;
            }
        }

        let flushed = self.writer.flush().await;
        match batch_err {
            Some(err) => Err(err),
            None => flushed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let buf = Arc::new(BufferSink::new());
        let sink = JsonSink::new(buf.clone(), false);

        sink.write(&[
            Event::new("a.go", "stdout", "one"),
            Event::new("", "stderr", "two"),
        ])
        .await
        .unwrap();

        let out = String::from_utf8(buf.contents()).unwrap();
        let lines: Vec<&str> = out.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let first: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.message, "one");
        let second: Event = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.stream, "stderr");
    }

    #[tokio::test]
    async fn filters_debug_events_when_configured() {
        let buf = Arc::new(BufferSink::new());
        let sink = JsonSink::new(buf.clone(), true);

        sink.write(&[
            Event::new("", "debug", "internal marker"),
            Event::new("", "stdout", "visible"),
        ])
        .await
        .unwrap();

        let out = String::from_utf8(buf.contents()).unwrap();
        assert!(!out.contains("internal marker"));
        assert!(out.contains("visible"));
    }

    #[tokio::test]
    async fn keeps_debug_events_by_default() {
        let buf = Arc::new(BufferSink::new());
        let sink = JsonSink::new(buf.clone(), false);

        sink.write(&[Event::new("", "debug", "marker")]).await.unwrap();
        assert!(String::from_utf8(buf.contents()).unwrap().contains("marker"));
    }
}
