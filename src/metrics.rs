use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    started_total: AtomicU64,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    timed_out_total: AtomicU64,
    sized_out_total: AtomicU64,
    cache_hits_total: AtomicU64,
    queue_depth: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub sized_out: u64,
    pub cache_hits: u64,
    pub queue_depth: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn completed(&self) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timed_out(&self) {
        self.timed_out_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sized_out(&self) {
        self.sized_out_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted_total.load(Ordering::Relaxed),
            started: self.started_total.load(Ordering::Relaxed),
            completed: self.completed_total.load(Ordering::Relaxed),
            failed: self.failed_total.load(Ordering::Relaxed),
            timed_out: self.timed_out_total.load(Ordering::Relaxed),
            sized_out: self.sized_out_total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits_total.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            concat!(
                "# TYPE compile_submitted_total counter\n",
                "compile_submitted_total {}\n",
                "# TYPE compile_started_total counter\n",
                "compile_started_total {}\n",
                "# TYPE compile_completed_total counter\n",
                "compile_completed_total {}\n",
                "# TYPE compile_failed_total counter\n",
                "compile_failed_total {}\n",
                "# TYPE compile_timed_out_total counter\n",
                "compile_timed_out_total {}\n",
                "# TYPE compile_sized_out_total counter\n",
                "compile_sized_out_total {}\n",
                "# TYPE compile_cache_hits_total counter\n",
                "compile_cache_hits_total {}\n",
                "# TYPE compile_queue_depth gauge\n",
                "compile_queue_depth {}\n"
            ),
            snapshot.submitted,
            snapshot.started,
            snapshot.completed,
            snapshot.failed,
            snapshot.timed_out,
            snapshot.sized_out,
            snapshot.cache_hits,
            snapshot.queue_depth,
        )
    }
}
