//! Relays the builder's stdout into an event sink, one JSON line at a time.
//!
//! The writer half enforces a cumulative byte budget with plain arithmetic
//! (line framing makes that possible) and a dedicated task does the line
//! splitting and decoding, so a slow HTTP client never stalls the reader
//! pumping the child's pipe beyond the channel's buffer.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{
    event::{Event, EventSink},
    sink::{ByteSink, OnceCallback, SinkError},
};

const RELAY_CHANNEL_CAPACITY: usize = 32;

pub struct LineRelay;

impl LineRelay {
    /// Spawns a relay task feeding `sink`. Returns the writer to pump raw
    /// bytes into and the stop handle.
    ///
    /// `on_limit` fires (once) when the cumulative byte budget is breached;
    /// `on_parse_error` fires when a line fails to decode. Both terminate
    /// the relay.
    pub fn spawn(
        sink: Arc<dyn EventSink>,
        limit: usize,
        on_limit: impl FnOnce() + Send + 'static,
        on_parse_error: impl FnOnce(anyhow::Error) + Send + 'static,
    ) -> (Arc<RelayWriter>, RelayStop) {
        let (tx, rx) = mpsc::channel::<Bytes>(RELAY_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let stop = RelayStop {
            inner: Arc::new(StopInner {
                cancel: cancel_tx,
                done: done_rx,
            }),
        };

        tokio::spawn(relay_loop(
            rx,
            cancel_rx,
            done_tx,
            sink,
            Box::new(on_parse_error),
        ));

        let writer = Arc::new(RelayWriter {
            tx,
            limit,
            written: Mutex::new(0),
            on_limit: OnceCallback::new(on_limit),
            stop: stop.clone(),
        });

        (writer, stop)
    }
}

/// Budget-checked byte feed into the relay task. Writes are admitted in
/// full or rejected in full, same as `LimitedWriter`.
pub struct RelayWriter {
    tx: mpsc::Sender<Bytes>,
    limit: usize,
    written: Mutex<usize>,
    on_limit: OnceCallback,
    stop: RelayStop,
}

#[async_trait]
impl ByteSink for RelayWriter {
    async fn write(&self, buf: &[u8]) -> Result<(), SinkError> {
        {
            let mut written = self.written.lock().unwrap();
            if *written + buf.len() > self.limit {
                *written = self.limit;
                drop(written);
                self.on_limit.call();
                // Signal only; blocking on relay termination here would
                // deadlock a callback that is itself stopping the relay.
                self.stop.signal();
                return Err(SinkError::LimitExceeded);
            }
            if buf.is_empty() {
                return Ok(());
            }
            *written += buf.len();
        }
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Idempotent stop handle for a relay. `signal` is fire-and-forget and safe
/// to call from anywhere, including the relay's own callbacks; `stop`
/// additionally waits for the relay task to exit.
#[derive(Clone)]
pub struct RelayStop {
    inner: Arc<StopInner>,
}

struct StopInner {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl RelayStop {
    pub fn signal(&self) {
        let _ = self.inner.cancel.send(true);
    }

    pub async fn stop(&self) {
        self.signal();
        let mut done = self.inner.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

async fn relay_loop(
    mut rx: mpsc::Receiver<Bytes>,
    mut cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    sink: Arc<dyn EventSink>,
    on_parse_error: Box<dyn FnOnce(anyhow::Error) + Send>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut parse_failure: Option<anyhow::Error> = None;

    loop {
        let chunk = tokio::select! {
            res = cancel_rx.changed() => {
                let _ = res;
                // Stop requested: relay whatever complete lines are already
                // buffered, then exit.
                rx.close();
                while let Ok(chunk) = rx.try_recv() {
                    pending.extend_from_slice(&chunk);
                    if let Err(err) = forward_lines(&mut pending, sink.as_ref()).await {
                        parse_failure = Some(err);
                        break;
                    }
                }
                break;
            }
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                // Writer dropped: clean EOF. A trailing unterminated line
                // is discarded.
                None => break,
            },
        };

        pending.extend_from_slice(&chunk);
        if let Err(err) = forward_lines(&mut pending, sink.as_ref()).await {
            parse_failure = Some(err);
            break;
        }
    }

    if let Some(err) = parse_failure {
        on_parse_error(err);
    }
    let _ = done_tx.send(true);
}

/// Decodes and forwards every complete line in `pending`. Sink errors are
/// not fatal: the recording half of the sink must keep observing events
/// even when the client transport has failed.
async fn forward_lines(pending: &mut Vec<u8>, sink: &dyn EventSink) -> Result<(), anyhow::Error> {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        match serde_json::from_slice::<Event>(&line) {
            Ok(event) => {
                if let Err(err) = sink.write(&[event]).await {
                    tracing::debug!(error = %err, "relay sink write failed");
                }
            }
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "failed to decode event line {:?}: {err}",
                    String::from_utf8_lossy(&line)
                ));
            }
        }
    }
    Ok(())
}
