//! Fixed pool of read-ahead buffers shared by every stream of a context.
//!
//! Every buffer is in exactly one of four places at any instant: the free
//! list, the queue, the in-progress set or the completed set. All moves
//! between them happen under one mutex; readers waiting for a fill are woken
//! through a [`Notify`] fired whenever any buffer completes.
//!
//! Completed buffers stay until they are older than the age threshold and
//! either a queue request needs their slot or their stream closes. A failed
//! fill is remembered the same way, so a reader that depends on it sees the
//! real error while it is fresh and a plain miss once it is stale.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::buffer::{BufferStatus, ReadBuffer, StreamId};
use crate::config::ReadAheadConfig;
use crate::error::Result;
use crate::io::RemoteReader;

/// Buffer counts per state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub free: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl PoolStatus {
    pub fn total(&self) -> usize {
        self.free + self.queued + self.in_progress + self.completed
    }
}

/// Work handed to a read-ahead worker; carries the buffer's storage.
pub(crate) struct FillRequest {
    pub(crate) id: u64,
    pub(crate) stream: StreamId,
    pub(crate) offset: u64,
    pub(crate) len: usize,
    pub(crate) source: Arc<dyn RemoteReader>,
    pub(crate) data: Vec<u8>,
}

struct PoolState {
    free: Vec<Vec<u8>>,
    queue: VecDeque<ReadBuffer>,
    in_progress: Vec<ReadBuffer>,
    completed: Vec<ReadBuffer>,
    next_id: u64,
}

impl PoolState {
    /// Whether an overlapping request for `stream` is queued, in flight, or
    /// completed and still fresh. Expired overlapping buffers are reclaimed
    /// on the way so two live buffers never overlap.
    fn is_already_queued(
        &mut self,
        stream: StreamId,
        offset: u64,
        len: usize,
        now: Instant,
        threshold: Duration,
    ) -> bool {
        if self
            .queue
            .iter()
            .chain(self.in_progress.iter())
            .any(|b| !b.orphaned && b.overlaps(stream, offset, len))
        {
            return true;
        }

        let mut i = 0;
        while i < self.completed.len() {
            let buf = &self.completed[i];
            if buf.overlaps(stream, offset, len) {
                if buf.age(now) < threshold {
                    return true;
                }
                let buf = self.completed.swap_remove(i);
                trace!(stream, offset = buf.offset, "Reclaiming expired overlapping buffer");
                self.free.push(buf.into_storage());
                continue;
            }
            i += 1;
        }
        false
    }

    /// Evict the oldest completed buffer past the threshold.
    fn try_evict(&mut self, now: Instant, threshold: Duration) -> bool {
        let oldest = self
            .completed
            .iter()
            .enumerate()
            .filter(|(_, b)| b.age(now) >= threshold)
            .max_by_key(|(_, b)| b.age(now))
            .map(|(i, _)| i);

        match oldest {
            Some(i) => {
                let buf = self.completed.swap_remove(i);
                debug!(
                    stream = buf.stream,
                    offset = buf.offset,
                    failed = matches!(buf.status, BufferStatus::Failed(_)),
                    "Evicted read-ahead buffer"
                );
                self.free.push(buf.into_storage());
                true
            }
            None => false,
        }
    }
}

/// Bounded, shared pool of read-ahead buffers.
pub struct ReadBufferPool {
    state: Mutex<PoolState>,
    buffer_size: usize,
    buffer_count: usize,
    threshold_age: Duration,
    block_wait_timeout: Duration,
    completion: Notify,
    work_available: Notify,
}

impl ReadBufferPool {
    /// Allocate every buffer up front.
    pub fn new(config: &ReadAheadConfig) -> Self {
        let free = (0..config.buffer_pool_size)
            .map(|_| vec![0u8; config.read_buffer_size])
            .collect();
        Self {
            state: Mutex::new(PoolState {
                free,
                queue: VecDeque::new(),
                in_progress: Vec::new(),
                completed: Vec::new(),
                next_id: 0,
            }),
            buffer_size: config.read_buffer_size,
            buffer_count: config.buffer_pool_size,
            threshold_age: config.buffer_age_threshold,
            block_wait_timeout: config.block_wait_timeout,
            completion: Notify::new(),
            work_available: Notify::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn threshold_age(&self) -> Duration {
        self.threshold_age
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            free: state.free.len(),
            queued: state.queue.len(),
            in_progress: state.in_progress.len(),
            completed: state.completed.len(),
        }
    }

    /// Queue a fill of `length` bytes (capped at the buffer size) at
    /// `offset` for `stream`.
    ///
    /// Returns false when an overlapping request already exists or no
    /// buffer is free even after trying to evict one.
    pub fn queue_read_ahead(
        &self,
        stream: StreamId,
        source: &Arc<dyn RemoteReader>,
        offset: u64,
        length: usize,
    ) -> bool {
        if length == 0 {
            return false;
        }
        let length = length.min(self.buffer_size);
        let now = Instant::now();

        let mut state = self.state.lock();
        if state.is_already_queued(stream, offset, length, now, self.threshold_age) {
            trace!(stream, offset, "Read-ahead already queued");
            return false;
        }
        if state.free.is_empty() && !state.try_evict(now, self.threshold_age) {
            trace!(stream, offset, "No free read-ahead buffer");
            return false;
        }
        let Some(data) = state.free.pop() else {
            return false;
        };

        state.next_id += 1;
        let id = state.next_id;
        state.queue.push_back(ReadBuffer::new(
            id,
            stream,
            Arc::clone(source),
            offset,
            length,
            data,
        ));
        drop(state);

        trace!(stream, offset, length, "Queued read-ahead");
        self.work_available.notify_one();
        true
    }

    /// Copy cached bytes for `stream` at `position` into `out`.
    ///
    /// Waits, up to the block wait timeout, for a queued or in-flight
    /// buffer covering `position`. Returns the stored error of a fresh
    /// failed buffer, and 0 on a miss, a stale failure or a timeout.
    pub async fn get_block(&self, stream: StreamId, position: u64, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.block_wait_timeout;

        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                let now = Instant::now();

                if let Some(buf) = state.completed.iter().find(|b| b.covers(stream, position)) {
                    return match &buf.status {
                        BufferStatus::Available => {
                            let n = buf.copy_to(position, out);
                            trace!(stream, position, n, "Read-ahead hit");
                            Ok(n)
                        }
                        BufferStatus::Failed(e) if buf.age(now) < self.threshold_age => {
                            debug!(stream, position, error = %e, "Read-ahead failed recently");
                            Err(e.clone())
                        }
                        BufferStatus::Failed(_) => {
                            trace!(stream, position, "Ignoring stale read-ahead failure");
                            Ok(0)
                        }
                        BufferStatus::Pending | BufferStatus::InProgress => Ok(0),
                    };
                }

                let in_flight = state
                    .queue
                    .iter()
                    .chain(state.in_progress.iter())
                    .any(|b| !b.orphaned && b.covers(stream, position));
                if !in_flight {
                    return Ok(0);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(stream, position, "Timed out waiting for read-ahead");
                return Ok(0);
            }
        }
    }

    /// Evict one completed buffer older than the threshold, oldest first.
    pub fn try_evict(&self) -> bool {
        self.state.lock().try_evict(Instant::now(), self.threshold_age)
    }

    /// Release every buffer of a closed stream. In-flight fills finish and
    /// then go straight back to the free list.
    pub fn purge_stream(&self, stream: StreamId) {
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut released = 0;
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for buf in state.queue.drain(..) {
            if buf.stream == stream {
                state.free.push(buf.into_storage());
                released += 1;
            } else {
                kept.push_back(buf);
            }
        }
        state.queue = kept;

        let mut i = 0;
        while i < state.completed.len() {
            if state.completed[i].stream == stream {
                let buf = state.completed.swap_remove(i);
                state.free.push(buf.into_storage());
                released += 1;
            } else {
                i += 1;
            }
        }

        for buf in state.in_progress.iter_mut().filter(|b| b.stream == stream) {
            buf.orphaned = true;
        }

        debug!(stream, released, "Purged stream buffers");
    }

    /// Take the oldest queued request, waiting until one exists.
    pub(crate) async fn next_fill(&self) -> FillRequest {
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.take_next() {
                return request;
            }
            notified.await;
        }
    }

    fn take_next(&self) -> Option<FillRequest> {
        let mut state = self.state.lock();
        let mut buf = state.queue.pop_front()?;
        buf.status = BufferStatus::InProgress;
        let request = FillRequest {
            id: buf.id,
            stream: buf.stream,
            offset: buf.offset,
            len: buf.requested_len,
            source: Arc::clone(&buf.source),
            data: std::mem::take(&mut buf.data),
        };
        state.in_progress.push(buf);
        Some(request)
    }

    /// Return a worker's storage with the outcome of the fill and wake
    /// every waiting reader.
    pub(crate) fn complete_fill(&self, id: u64, data: Vec<u8>, result: Result<usize>) {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(index) = state.in_progress.iter().position(|b| b.id == id) else {
            warn!(id, "Completed fill has no in-progress buffer");
            state.free.push(data);
            return;
        };
        let mut buf = state.in_progress.swap_remove(index);
        buf.data = data;

        if buf.orphaned {
            trace!(stream = buf.stream, offset = buf.offset, "Dropping fill for closed stream");
            state.free.push(buf.into_storage());
        } else {
            match result {
                Ok(n) => {
                    buf.bytes_filled = n.min(buf.requested_len);
                    buf.status = BufferStatus::Available;
                }
                Err(e) => {
                    buf.bytes_filled = 0;
                    buf.status = BufferStatus::Failed(e);
                }
            }
            buf.completed_at = Some(now);
            state.completed.push(buf);
        }
        drop(state);

        self.completion.notify_waiters();
    }
}
