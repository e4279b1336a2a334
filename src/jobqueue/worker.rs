use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::watch,
};

use crate::{
    event::{self, Event, EventSink, LineRelay, STREAM_STDERR},
    jobqueue::job::{Job, JobResult},
    metrics::MetricsRegistry,
    sandbox::SandboxBackend,
    sink::{BufferSink, ByteSink, LimitedWriter},
};

/// Delivers at most one kill to the child-driving task, no matter how many
/// of the independent trigger paths (output size, stderr size, parse error,
/// wall clock) race on it.
pub struct KillOnce {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl KillOnce {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(true);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for KillOnce {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived identity inside a dispatcher's pool. Holds no per-job state.
pub struct Worker {
    pub id: usize,
}

impl Worker {
    pub fn new(id: usize) -> Self {
        Self { id }
    }

    /// Runs one job to completion: launches the sandboxed builder, relays
    /// its stdout as events, enforces the output, stderr and wall-clock
    /// budgets, and reports a terminal stderr event when anything tripped.
    pub async fn run(
        &self,
        job: &Job,
        sandbox: &dyn SandboxBackend,
        metrics: &MetricsRegistry,
    ) -> JobResult {
        event::debug(job.sink.as_ref(), "Preparing to run program").await;

        let handle = match sandbox.launch(&job.id, job.memory_mb).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(job = %job.id, error = %err, "sandbox launch failed");
                let _ = job
                    .sink
                    .write(&[Event::new("", STREAM_STDERR, "Internal error, please retry.")])
                    .await;
                return JobResult {
                    success: false,
                    events: None,
                };
            }
        };
        let mut child = handle.child;
        let cleanup = handle.cleanup;

        if let Some(mut stdin) = child.stdin.take() {
            let body = job.body.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(&body).await;
                let _ = stdin.shutdown().await;
            });
        }

        let sized_out = Arc::new(AtomicBool::new(false));
        let errored_out = Arc::new(AtomicBool::new(false));
        let kill = Arc::new(KillOnce::new());

        // Builder stdout must already be a JSON event stream; relay it to
        // the client under the job's output budget.
        let (relay_writer, relay_stop) = LineRelay::spawn(
            job.sink.clone() as Arc<dyn EventSink>,
            job.max_size,
            {
                let sized_out = sized_out.clone();
                let kill = kill.clone();
                move || {
                    sized_out.store(true, Ordering::SeqCst);
                    kill.fire();
                }
            },
            {
                let errored_out = errored_out.clone();
                let kill = kill.clone();
                let id = job.id.clone();
                // Unparseable stdout can be a builder bug or an exploit
                // escaping the sandbox's stdout; either way it is logged
                // and never surfaced verbatim.
                move |err| {
                    tracing::warn!(job = %id, error = %err, "builder stdout relay error");
                    errored_out.store(true, Ordering::SeqCst);
                    kill.fire();
                }
            },
        );

        // Stderr is unexpected. It is captured quietly, bounded by the same
        // budget, and logged rather than forwarded.
        let stderr_buf = Arc::new(BufferSink::new());
        let stderr_writer = Arc::new(LimitedWriter::new(
            stderr_buf.clone() as Arc<dyn ByteSink>,
            job.max_size,
            {
                let errored_out = errored_out.clone();
                let kill = kill.clone();
                move || {
                    errored_out.store(true, Ordering::SeqCst);
                    kill.fire();
                }
            },
        ));

        let stdout_pump = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(pump(stdout, relay_writer as Arc<dyn ByteSink>)));
        let stderr_pump = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump(stderr, stderr_writer as Arc<dyn ByteSink>)));

        event::debug(job.sink.as_ref(), "Running program").await;

        let mut kill_rx = kill.subscribe();
        let kill_sink = job.sink.clone();
        let wait_fut = async move {
            let mut killed = false;
            loop {
                tokio::select! {
                    status = child.wait() => break status,
                    res = kill_rx.changed(), if !killed => {
                        let _ = res;
                        killed = true;
                        event::debug(kill_sink.as_ref(), "Killing program").await;
                        if let Err(err) = child.start_kill() {
                            tracing::warn!(error = %err, "failed to kill sandbox child");
                        }
                    }
                }
            }
        };
        tokio::pin!(wait_fut);

        let mut timed_out = false;
        let exit = match tokio::time::timeout(job.max_time, &mut wait_fut).await {
            Ok(exit) => exit,
            Err(_) => {
                // Even after the kill, wait for the real exit so the pipes
                // drain and no zombie is left behind.
                timed_out = true;
                metrics.timed_out();
                kill.fire();
                wait_fut.await
            }
        };

        match exit {
            Ok(status) => {
                if !status.success() && !sized_out.load(Ordering::SeqCst) {
                    errored_out.store(true, Ordering::SeqCst);
                }
            }
            Err(err) => {
                tracing::error!(job = %job.id, error = %err, "waiting for sandbox child failed");
                errored_out.store(true, Ordering::SeqCst);
            }
        }

        if let Some(task) = stdout_pump {
            let _ = task.await;
        }
        if let Some(task) = stderr_pump {
            let _ = task.await;
        }

        relay_stop.stop().await;

        event::debug(job.sink.as_ref(), "Program exited").await;

        let sized = sized_out.load(Ordering::SeqCst);
        let errored = errored_out.load(Ordering::SeqCst);

        // Precedence: a timeout may have provoked the error flag via the
        // exit-code check after the kill, so timeout wins; a size breach
        // alone is user-attributable and reported as such.
        let terminal = if timed_out {
            Some("Internal timeout, please retry.")
        } else if errored {
            Some("Internal error, please retry.")
        } else if sized {
            Some("Program output too large, killed.")
        } else {
            None
        };
        if let Some(message) = terminal {
            let _ = job
                .sink
                .write(&[Event::new("", STREAM_STDERR, message)])
                .await;
        }

        let stderr_bytes = stderr_buf.contents();
        if !stderr_bytes.is_empty() {
            tracing::warn!(
                job = %job.id,
                stderr = %String::from_utf8_lossy(&stderr_bytes),
                "builder stderr"
            );
        }

        event::debug(job.sink.as_ref(), "Response finished").await;

        cleanup.run().await;

        if sized {
            metrics.sized_out();
        }

        if timed_out || errored || sized {
            JobResult {
                success: false,
                events: None,
            }
        } else {
            JobResult {
                success: true,
                events: Some(job.sink.drain().await),
            }
        }
    }
}

async fn pump<R>(mut reader: R, sink: Arc<dyn ByteSink>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write(&chunk[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}
