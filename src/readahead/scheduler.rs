use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::pool::{FillRequest, ReadBufferPool};
use crate::error::Error;

/// Fixed set of worker tasks draining the pool's queue.
///
/// Workers take requests oldest first and issue exactly one remote read per
/// request. Retries belong to the REST layer below; a failed or panicking
/// fill is recorded on the buffer and the worker moves on.
pub struct ReadAheadScheduler {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ReadAheadScheduler {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn start(pool: Arc<ReadBufferPool>, workers: usize) -> Self {
        let cancel = CancellationToken::new();
        let workers = (0..workers)
            .map(|worker| {
                let pool = Arc::clone(&pool);
                let cancel = cancel.clone();
                tokio::spawn(run_worker(worker, pool, cancel))
            })
            .collect();

        Self { cancel, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new work and wait for in-flight fills to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Read-ahead worker ended abnormally");
            }
        }
    }
}

impl Drop for ReadAheadScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(worker: usize, pool: Arc<ReadBufferPool>, cancel: CancellationToken) {
    trace!(worker, "Read-ahead worker started");
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = pool.next_fill() => request,
        };
        fill(worker, &pool, request).await;
    }
    trace!(worker, "Read-ahead worker stopped");
}

async fn fill(worker: usize, pool: &ReadBufferPool, request: FillRequest) {
    let FillRequest {
        id,
        stream,
        offset,
        len,
        source,
        mut data,
    } = request;
    let len = len.min(data.len());
    let started = Instant::now();

    let outcome = AssertUnwindSafe(source.read_at(offset, &mut data[..len]))
        .catch_unwind()
        .await;
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => Err(Error::ReadAheadWorker(panic_message(panic.as_ref()))),
    };

    match &result {
        Ok(n) => trace!(
            worker,
            stream,
            offset,
            bytes = n,
            elapsed = ?started.elapsed(),
            "Read-ahead fill complete"
        ),
        Err(e) => debug!(worker, stream, offset, error = %e, "Read-ahead fill failed"),
    }

    pool.complete_fill(id, data, result);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}
