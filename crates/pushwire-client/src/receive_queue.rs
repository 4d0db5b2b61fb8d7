//! Ordered receive pipeline.
//!
//! A single worker task runs queued jobs one at a time in enqueue order. The
//! worker does not start until the readiness signal fires, so work queued
//! while the transport is still starting runs only after the start sequence
//! completes. If the signal is dropped unsent, queued work is discarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ClientResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Strictly ordered, readiness-gated job queue.
pub struct ReceiveQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    done: watch::Receiver<bool>,
}

impl ReceiveQueue {
    /// Create a queue whose worker waits for `ready` before running jobs.
    ///
    /// If `cancel` fires or `ready` is dropped before readiness, queued jobs
    /// are discarded.
    pub fn new(ready: oneshot::Receiver<()>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done) = watch::channel(false);
        tokio::spawn(run_worker(rx, ready, cancel, done_tx));
        Self {
            tx: Mutex::new(Some(tx)),
            done,
        }
    }

    /// Append a job. Fails once the queue has been drained.
    pub fn enqueue<F>(&self, job: F) -> ClientResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The lock orders concurrent producers.
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(Box::pin(job)).map_err(|_| ClientError::QueueDrained),
            None => Err(ClientError::QueueDrained),
        }
    }

    /// Stop admitting work. The returned handle resolves once every job
    /// admitted before the drain has finished.
    pub fn drain(&self) -> DrainHandle {
        self.tx.lock().take();
        DrainHandle {
            done: self.done.clone(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Resolves when a drained queue has gone idle.
#[derive(Debug, Clone)]
pub struct DrainHandle {
    done: watch::Receiver<bool>,
}

impl DrainHandle {
    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    pub async fn wait(mut self) {
        // An error means the worker is gone, which is also idle.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    ready: oneshot::Receiver<()>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        signal = ready => signal.is_ok(),
    };

    if opened {
        while let Some(job) = rx.recv().await {
            let outcome = AssertUnwindSafe(job).catch_unwind().await;
            if outcome.is_err() {
                tracing::warn!("receive job panicked; continuing with next item");
            }
        }
    } else {
        tracing::debug!("receive queue closed before start completed");
    }

    done.send_replace(true);
}
