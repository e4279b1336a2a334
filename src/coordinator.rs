//! Request-execution engine behind `POST /compile`: admission, response
//! cache, job construction, and supervision of in-flight jobs.

use std::{
    convert::Infallible,
    sync::Arc,
};

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    cache::{CachedResponse, Fingerprint, ResponseCache, fingerprint},
    config::CoordinatorConfig,
    event::{self, Event, EventSink, JsonSink, RecordingSink, STREAM_STDERR},
    jobqueue::{Dispatcher, Job, JobIdGen, JobResult},
    metrics::MetricsRegistry,
    sandbox::SandboxFactory,
    sink::{ChannelSink, LimitedWriter},
};

const RESPONSE_CHANNEL_CAPACITY: usize = 32;

/// Owns the process-wide mutable state (response cache, id generator) and
/// the dispatcher. One per process, shared by all handler tasks.
pub struct Coordinator {
    pub config: CoordinatorConfig,
    cache: ResponseCache,
    dispatcher: Dispatcher,
    ids: JobIdGen,
    metrics: Arc<MetricsRegistry>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, metrics: Arc<MetricsRegistry>) -> anyhow::Result<Self> {
        let sandbox = SandboxFactory::from_config(&config)?;
        let dispatcher = Dispatcher::new(
            config.parallelism,
            config.job_queue_cap,
            sandbox,
            metrics.clone(),
        );
        Ok(Self {
            cache: ResponseCache::new(config.cache_capacity),
            dispatcher,
            ids: JobIdGen::new(),
            metrics,
            config,
        })
    }

    /// Waits for in-flight jobs and rejects everything still queued.
    pub async fn stop(&self) {
        self.dispatcher.stop().await;
    }

    /// Handles one accepted compile body. The returned response streams
    /// events as the job produces them; all per-request work beyond cache
    /// lookup and enqueueing happens in detached tasks so the stream can
    /// start flowing immediately.
    pub async fn compile(self: Arc<Self>, body: Bytes, want_debug: bool) -> Response {
        if body.len() > self.config.max_size {
            return self.reject_oversize(want_debug);
        }

        let key = fingerprint(&body);
        if let Some(cached) = self.cache.get(&key) {
            self.metrics.cache_hit();
            let status =
                StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
            let (response, sink, _tx) = self.open_response(status, want_debug);
            tokio::spawn(async move {
                event::debug(&sink, "Sending cached response").await;
                if let Err(err) = sink.write(&cached.events).await {
                    tracing::debug!(error = %err, "cached replay aborted");
                }
            });
            return response;
        }

        let (response, sink, body_tx) = self.open_response(StatusCode::OK, want_debug);
        let recording = Arc::new(RecordingSink::new(sink));

        let (job, result_rx) = Job::new(
            &self.ids,
            body,
            recording.clone(),
            self.config.max_size,
            self.config.max_time,
            self.config.per_job_memory_mb(),
        );

        if self.dispatcher.enqueue(job.clone()).is_err() {
            tracing::warn!(job = %job.id, "job queue full, rejecting request");
            tokio::spawn(async move {
                let _ = recording
                    .write(&[Event::new(
                        "",
                        STREAM_STDERR,
                        "Service busy. Please try again later.",
                    )])
                    .await;
            });
            return response;
        }
        self.metrics.submitted();

        let coordinator = Arc::clone(&self);
        tokio::spawn(async move {
            coordinator
                .supervise(job, result_rx, recording, key, body_tx)
                .await;
        });

        response
    }

    /// Response for a body strictly larger than the configured maximum.
    pub fn reject_oversize(&self, want_debug: bool) -> Response {
        let (response, sink, _tx) = self.open_response(StatusCode::BAD_REQUEST, want_debug);
        tokio::spawn(async move {
            let _ = sink
                .write(&[Event::new("", STREAM_STDERR, "Program too large.")])
                .await;
        });
        response
    }

    /// Awaits the job's result while watching for client disconnect. A
    /// disconnect cancels the job but never abandons the result channel:
    /// worker resources must always be released through the normal path.
    async fn supervise(
        self: Arc<Self>,
        job: Arc<Job>,
        mut result_rx: oneshot::Receiver<JobResult>,
        recording: Arc<RecordingSink>,
        key: Fingerprint,
        body_tx: mpsc::Sender<Result<Bytes, Infallible>>,
    ) {
        let disconnected = body_tx.closed();
        tokio::pin!(disconnected);
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = &mut disconnected, if !cancelled => {
                    tracing::info!(job = %job.id, "client disconnected, cancelling job");
                    cancelled = true;
                    job.cancel();
                }
                result = &mut result_rx => {
                    match result {
                        Ok(result) if result.success => {
                            event::debug(recording.as_ref(), "Caching response").await;
                            self.cache.insert(
                                key,
                                CachedResponse {
                                    status: StatusCode::OK.as_u16(),
                                    events: result.events.unwrap_or_default(),
                                },
                            );
                        }
                        Ok(_) => {
                            event::debug(
                                recording.as_ref(),
                                "Internal errors encountered, not caching response",
                            )
                            .await;
                        }
                        Err(_) => {
                            tracing::error!(job = %job.id, "job dropped without delivering a result");
                        }
                    }
                    break;
                }
            }
        }
    }

    /// Opens a chunked event-stream response. The writer chain is
    /// ChannelSink -> LimitedWriter -> JsonSink; the hard `2 * max_size`
    /// cap leaves one `max_size` for builder output and one for the
    /// coordinator's own error and status messages.
    fn open_response(
        &self,
        status: StatusCode,
        want_debug: bool,
    ) -> (Response, JsonSink, mpsc::Sender<Result<Bytes, Infallible>>) {
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(RESPONSE_CHANNEL_CAPACITY);

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let channel = Arc::new(ChannelSink::new(tx.clone()));
        let limited = Arc::new(LimitedWriter::new(
            channel,
            2 * self.config.max_size,
            || {
                tracing::warn!("hard response size limit reached");
            },
        ));
        let sink = JsonSink::new(limited, !want_debug);

        (response, sink, tx)
    }

    /// Number of cached responses, for health introspection and tests.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
