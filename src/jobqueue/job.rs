use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::event::{Event, RecordingSink};

/// Hands out process-unique job ids. The counter is seeded from the clock
/// so ids stay unique across coordinator restarts, which matters because
/// the id doubles as the sandbox container name.
pub struct JobIdGen {
    next: AtomicI64,
}

impl JobIdGen {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            next: AtomicI64::new(seed),
        }
    }

    pub fn next(&self) -> String {
        format!("playpen_{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for JobIdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct JobResult {
    pub success: bool,
    pub events: Option<Vec<Event>>,
}

impl JobResult {
    pub fn rejected() -> Self {
        Self {
            success: false,
            events: None,
        }
    }
}

/// One queued compile request. Shared between the enqueueing handler (which
/// may cancel it) and the dispatcher (which runs or rejects it).
pub struct Job {
    pub id: String,
    pub body: Bytes,
    pub sink: Arc<RecordingSink>,
    pub max_size: usize,
    pub max_time: Duration,
    pub memory_mb: u64,

    cancelled: Mutex<bool>,
    result_tx: Mutex<Option<oneshot::Sender<JobResult>>>,
}

impl Job {
    pub fn new(
        ids: &JobIdGen,
        body: Bytes,
        sink: Arc<RecordingSink>,
        max_size: usize,
        max_time: Duration,
        memory_mb: u64,
    ) -> (Arc<Self>, oneshot::Receiver<JobResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        let job = Arc::new(Self {
            id: ids.next(),
            body,
            sink,
            max_size,
            max_time,
            memory_mb,
            cancelled: Mutex::new(false),
            result_tx: Mutex::new(Some(result_tx)),
        });
        (job, result_rx)
    }

    /// Prevents the job from running if it has not been picked up by a
    /// worker yet. Has no effect on a job already dispatched.
    pub fn cancel(&self) {
        tracing::info!(job = %self.id, "cancelling job");
        *self.cancelled.lock().unwrap() = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap()
    }

    /// Delivers the job's one result. The sender is taken out of its slot,
    /// so a second delivery attempt is a no-op by construction.
    pub fn deliver(&self, result: JobResult) {
        let tx = self.result_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}
