use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    event::{Event, EventSink, JsonSink},
    sink::SinkError,
};

/// An event sink that also retains every event passed to it, so a finished
/// run can be replayed from the cache.
///
/// Retention is deliberately decoupled from downstream success: a cached
/// replay must reproduce what the client *should have* seen, not only what
/// a flaky transport managed to deliver. The single lock orders retention
/// and the downstream write identically for concurrent writers.
pub struct RecordingSink {
    inner: JsonSink,
    written: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new(inner: JsonSink) -> Self {
        Self {
            inner,
            written: Mutex::new(Vec::new()),
        }
    }

    /// Returns and clears the retained events in one atomic step.
    pub async fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.written.lock().await)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn write(&self, events: &[Event]) -> Result<(), SinkError> {
        let mut written = self.written.lock().await;
        written.extend_from_slice(events);
        self.inner.write(events).await
    }
}
