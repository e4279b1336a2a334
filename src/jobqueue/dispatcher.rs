use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::{
    jobqueue::{
        job::{Job, JobResult},
        worker::Worker,
    },
    metrics::MetricsRegistry,
    sandbox::SandboxBackend,
};

#[derive(Debug, Error)]
#[error("job queue full")]
pub struct QueueFull;

/// Owns the bounded job queue and the worker pool.
///
/// Jobs are dispatched FIFO up to the point they are paired with a free
/// worker. Stopping rejects everything still queued and returns only after
/// every in-flight job has delivered its result.
pub struct Dispatcher {
    job_tx: mpsc::Sender<Arc<Job>>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        workers: usize,
        queue_cap: usize,
        sandbox: Arc<dyn SandboxBackend>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let workers = workers.max(1);
        let (job_tx, job_rx) = mpsc::channel(queue_cap.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let (worker_tx, worker_rx) = mpsc::channel(workers);
        for id in 0..workers {
            let _ = worker_tx.try_send(Worker::new(id));
        }

        tracing::info!(workers, backend = sandbox.name(), "dispatcher starting workers");
        tokio::spawn(scheduler(
            job_rx,
            worker_tx,
            worker_rx,
            stop_rx,
            done_tx,
            sandbox,
            metrics,
        ));

        Self {
            job_tx,
            stop_tx,
            done_rx,
        }
    }

    /// Non-blocking enqueue. The caller already holds the job's result
    /// receiver; a full (or stopped) queue is reported immediately.
    pub fn enqueue(&self, job: Arc<Job>) -> Result<(), QueueFull> {
        match self.job_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(_) => Err(QueueFull),
        }
    }

    /// Stops dispatching, rejects the queued backlog, and waits for all
    /// running jobs to finish. Idempotent.
    pub async fn stop(&self) {
        tracing::info!("stopping dispatcher");
        let _ = self.stop_tx.send(true);
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

async fn scheduler(
    mut job_rx: mpsc::Receiver<Arc<Job>>,
    worker_tx: mpsc::Sender<Worker>,
    mut worker_rx: mpsc::Receiver<Worker>,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    sandbox: Arc<dyn SandboxBackend>,
    metrics: Arc<MetricsRegistry>,
) {
    let (inflight_tx, inflight_rx) = watch::channel(0usize);
    let inflight_tx = Arc::new(inflight_tx);

    loop {
        // Wait for a free worker, racing the stop signal.
        let worker = tokio::select! {
            res = stop_rx.wait_for(|stopped| *stopped) => {
                let _ = res;
                break;
            }
            worker = worker_rx.recv() => match worker {
                Some(worker) => worker,
                None => break,
            },
        };

        // Then wait for the next job, still racing stop.
        let job = tokio::select! {
            res = stop_rx.wait_for(|stopped| *stopped) => {
                let _ = res;
                break;
            }
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if job.is_cancelled() {
            tracing::info!(job = %job.id, "rejecting cancelled job");
            job.deliver(JobResult::rejected());
            let _ = worker_tx.send(worker).await;
            continue;
        }

        tracing::info!(job = %job.id, worker = worker.id, "dispatching job");
        metrics.started();
        inflight_tx.send_modify(|count| *count += 1);

        let worker_tx = worker_tx.clone();
        let inflight_tx = inflight_tx.clone();
        let sandbox = sandbox.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let result = worker.run(&job, sandbox.as_ref(), &metrics).await;
            if result.success {
                metrics.completed();
            } else {
                metrics.failed();
            }
            tracing::info!(job = %job.id, worker = worker.id, success = result.success, "job finished");
            job.deliver(result);
            let _ = worker_tx.send(worker).await;
            inflight_tx.send_modify(|count| *count -= 1);
        });
    }

    tracing::info!("dispatcher stopped, draining queue");

    // Everything still queued is treated as cancelled.
    job_rx.close();
    while let Ok(job) = job_rx.try_recv() {
        tracing::info!(job = %job.id, "dispatcher stopped, rejecting job");
        job.deliver(JobResult::rejected());
    }

    let mut inflight = inflight_rx;
    let _ = inflight.wait_for(|count| *count == 0).await;
    tracing::info!("dispatcher drained");
    let _ = done_tx.send(true);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        event::{JsonSink, RecordingSink},
        jobqueue::job::JobIdGen,
        sandbox::ProcessSandbox,
        sink::BufferSink,
    };

    fn shell_backend(script: &str) -> Arc<dyn SandboxBackend> {
        Arc::new(
            ProcessSandbox::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ])
            .unwrap(),
        )
    }

    fn queued_job(ids: &JobIdGen) -> (Arc<Job>, tokio::sync::oneshot::Receiver<JobResult>) {
        let sink = Arc::new(RecordingSink::new(JsonSink::new(
            Arc::new(BufferSink::new()),
            false,
        )));
        Job::new(
            ids,
            Bytes::from_static(b"bundle"),
            sink,
            4096,
            Duration::from_secs(10),
            64,
        )
    }

    #[tokio::test]
    async fn runs_a_job_to_success() {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Dispatcher::new(2, 4, shell_backend("true"), metrics.clone());
        let ids = JobIdGen::new();

        let (job, rx) = queued_job(&ids);
        dispatcher.enqueue(job).unwrap();

        let result = rx.await.unwrap();
        assert!(result.success);
        assert_eq!(metrics.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn enqueue_returns_busy_when_queue_is_full() {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Dispatcher::new(1, 1, shell_backend("sleep 2"), metrics);
        let ids = JobIdGen::new();

        let (first, _rx1) = queued_job(&ids);
        dispatcher.enqueue(first).unwrap();
        // Give the scheduler time to hand the first job to the only worker.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (second, _rx2) = queued_job(&ids);
        dispatcher.enqueue(second).unwrap();

        let (third, _rx3) = queued_job(&ids);
        assert!(dispatcher.enqueue(third).is_err());
    }

    #[tokio::test]
    async fn cancelled_job_is_rejected_before_running() {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Dispatcher::new(1, 4, shell_backend("sleep 1"), metrics.clone());
        let ids = JobIdGen::new();

        let (running, _rx) = queued_job(&ids);
        dispatcher.enqueue(running).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (cancelled, rx) = queued_job(&ids);
        cancelled.cancel();
        dispatcher.enqueue(cancelled).unwrap();

        let result = rx.await.unwrap();
        assert!(!result.success);
        assert!(result.events.is_none());
        // The cancelled job never consumed a worker slot.
        assert_eq!(metrics.snapshot().started, 1);
    }

    #[tokio::test]
    async fn stop_rejects_backlog_and_waits_for_inflight() {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Dispatcher::new(1, 4, shell_backend("sleep 1"), metrics.clone());
        let ids = JobIdGen::new();

        let (running, running_rx) = queued_job(&ids);
        dispatcher.enqueue(running).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (queued, queued_rx) = queued_job(&ids);
        dispatcher.enqueue(queued).unwrap();

        dispatcher.stop().await;

        // The queued job was rejected, the running one ran to completion,
        // and both receivers got exactly one value.
        let queued_result = queued_rx.await.unwrap();
        assert!(!queued_result.success);
        let running_result = running_rx.await.unwrap();
        assert!(running_result.success);

        // New work after stop is refused.
        let (late, _late_rx) = queued_job(&ids);
        assert!(dispatcher.enqueue(late).is_err());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Dispatcher::new(1, 1, shell_backend("true"), metrics);
        dispatcher.stop().await;
        dispatcher.stop().await;
    }
}
