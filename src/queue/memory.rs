// src/queue/memory.rs
// =============================================================================
// Bounded in-memory queue.
//
// Jobs travel through a fixed-capacity tokio channel. Accounting uses atomic
// counters only:
// - buffered:    scheduled, not yet handed to a worker
// - in_flight:   handed to a worker, not yet acknowledged
// - done:        acknowledged
// - outstanding: buffered + in_flight as one counter, so "no more work" is a
//                single atomic transition instead of a read of two counters
//
// With auto-close on (the default) the queue closes itself as soon as
// `outstanding` is zero: when an acknowledgment takes the last job, or when a
// worker asks for a job from a queue that never had any. `get` then reports
// EndOfStream. The bus queue uses the same shape with auto-close off.
//
// `outstanding` only goes up under the sender read lock and only reaches zero
// under the write lock, so a schedule either lands before the queue closes
// or fails with Closed.
// =============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use super::{Acknowledge, Job, Queue};
use crate::context::JobContext;
use crate::error::QueueError;
use crate::request::Request;

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub buffered: usize,
    pub in_flight: usize,
    pub done: u64,
}

#[derive(Default)]
struct Counters {
    buffered: AtomicUsize,
    in_flight: AtomicUsize,
    outstanding: AtomicUsize,
    done: AtomicU64,
}

struct Inner {
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<mpsc::Receiver<Job>>,
    counters: Counters,
    auto_close: bool,
}

impl Inner {
    fn close(&self) -> bool {
        self.sender.write().take().is_some()
    }

    /// Closes an auto-closing queue that has nothing outstanding.
    fn close_if_idle(&self) -> bool {
        if !self.auto_close {
            return false;
        }
        let mut sender = self.sender.write();
        self.counters.outstanding.load(Ordering::SeqCst) == 0 && sender.take().is_some()
    }

    fn acknowledge(&self) {
        if !decrement(&self.counters.in_flight, "in_flight") {
            return;
        }
        self.counters.done.fetch_add(1, Ordering::SeqCst);
        let mut sender = self.sender.write();
        let previous = self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.auto_close && sender.take().is_some() {
            debug!("memory queue drained; closing");
        }
    }
}

// Checked decrement. Underflow means a job was acknowledged that the queue
// never released, which is a bookkeeping bug.
fn decrement(counter: &AtomicUsize, name: &str) -> bool {
    let result = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    if result.is_err() {
        error!(counter = name, "queue counter underflow");
    }
    result.is_ok()
}

/// Completes a memory job and forwards to the job's own acknowledgment, if any.
struct MemoryAck {
    queue: Arc<Inner>,
    next: Option<Box<dyn Acknowledge>>,
}

impl Acknowledge for MemoryAck {
    fn done(self: Box<Self>) {
        let MemoryAck { queue, next } = *self;
        queue.acknowledge();
        if let Some(next) = next {
            next.done();
        }
    }

    fn abandon(self: Box<Self>) {
        let MemoryAck { queue, next } = *self;
        queue.acknowledge();
        if let Some(next) = next {
            next.abandon();
        }
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    /// A queue of `capacity` slots that closes itself whenever nothing is
    /// outstanding. Schedule the first jobs before anything calls `get`.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, true)
    }

    /// A queue of `capacity` slots that stays open until `close()`.
    pub fn buffer(capacity: usize) -> Self {
        Self::build(capacity, false)
    }

    fn build(capacity: usize, auto_close: bool) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender: RwLock::new(Some(sender)),
                receiver: Mutex::new(receiver),
                counters: Counters::default(),
                auto_close,
            }),
        }
    }

    /// Enqueues a prebuilt job. Its own acknowledgment runs after the queue's.
    /// If the queue is closed the job is abandoned and `Closed` is returned.
    pub async fn push(&self, job: Job) -> Result<(), QueueError> {
        let counters = &self.inner.counters;
        let sender = {
            let guard = self.inner.sender.read();
            match guard.as_ref() {
                Some(sender) => {
                    counters.outstanding.fetch_add(1, Ordering::SeqCst);
                    counters.buffered.fetch_add(1, Ordering::SeqCst);
                    sender.clone()
                }
                None => {
                    drop(guard);
                    job.abandon();
                    return Err(QueueError::Closed);
                }
            }
        };

        // The clone keeps the channel open, so the send completes even if the
        // queue is closed while it waits for capacity.
        if let Err(mpsc::error::SendError(job)) = sender.send(job).await {
            decrement(&counters.buffered, "buffered");
            counters.outstanding.fetch_sub(1, Ordering::SeqCst);
            job.abandon();
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.inner.counters;
        QueueStats {
            buffered: counters.buffered.load(Ordering::SeqCst),
            in_flight: counters.in_flight.load(Ordering::SeqCst),
            done: counters.done.load(Ordering::SeqCst),
        }
    }

    /// True while there is buffered or in-flight work.
    pub fn has_work(&self) -> bool {
        self.inner.counters.outstanding.load(Ordering::SeqCst) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.read().is_none()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn schedule(&self, ctx: JobContext, request: Request) -> Result<(), QueueError> {
        self.push(Job::new(ctx, request)).await
    }

    async fn get(&self) -> Result<Job, QueueError> {
        let mut receiver = self.inner.receiver.lock().await;
        if self.inner.close_if_idle() {
            debug!("memory queue empty; closing");
        }
        let job = receiver.recv().await;
        match job {
            Some(mut job) => {
                let counters = &self.inner.counters;
                counters.in_flight.fetch_add(1, Ordering::SeqCst);
                decrement(&counters.buffered, "buffered");
                let next = job.take_ack();
                Ok(job.with_ack(Box::new(MemoryAck {
                    queue: Arc::clone(&self.inner),
                    next,
                })))
            }
            None => Err(QueueError::EndOfStream),
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.inner.close() {
            debug!("memory queue closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(n: usize) -> Request {
        Request::new(format!("http://x.test/{n}"))
    }

    #[tokio::test]
    async fn test_drains_to_end_of_stream() {
        let queue = MemoryQueue::new(8);
        for n in 0..3 {
            queue.schedule(JobContext::new(), request(n)).await.unwrap();
        }
        assert_eq!(queue.stats().buffered, 3);

        for _ in 0..3 {
            let job = queue.get().await.unwrap();
            assert_eq!(queue.stats().in_flight, 1);
            job.done();
        }

        assert_eq!(
            queue.stats(),
            QueueStats {
                buffered: 0,
                in_flight: 0,
                done: 3
            }
        );
        assert!(queue.is_closed());
        assert!(matches!(queue.get().await, Err(QueueError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_get_on_never_used_queue_ends_stream() {
        let queue = MemoryQueue::new(8);
        let next = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("get blocked on an empty queue");
        assert!(matches!(next, Err(QueueError::EndOfStream)));
        assert!(queue.is_closed());

        let err = queue.schedule(JobContext::new(), request(0)).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn test_waiting_get_ends_when_last_job_completes() {
        let queue = MemoryQueue::new(8);
        queue.schedule(JobContext::new(), request(0)).await.unwrap();
        let job = queue.get().await.unwrap();

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        job.done();
        assert!(matches!(waiting.await.unwrap(), Err(QueueError::EndOfStream)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_schedule_racing_last_done_never_lands_after_close() {
        for _ in 0..200 {
            let queue = MemoryQueue::new(8);
            queue.schedule(JobContext::new(), request(0)).await.unwrap();
            let job = queue.get().await.unwrap();

            let racer = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.schedule(JobContext::new(), request(1)).await })
            };
            job.done();
            let accepted = racer.await.unwrap().is_ok();

            // An accepted job keeps the queue open until it is handed out.
            if accepted {
                assert!(!queue.is_closed());
                queue.get().await.unwrap().done();
            }
            assert!(queue.is_closed());
            assert!(matches!(queue.get().await, Err(QueueError::EndOfStream)));
            let stats = queue.stats();
            assert_eq!((stats.buffered, stats.in_flight), (0, 0));
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new(8);
        for n in 0..4 {
            queue.schedule(JobContext::new(), request(n)).await.unwrap();
        }
        for n in 0..4 {
            let job = queue.get().await.unwrap();
            assert_eq!(job.request().url, format!("http://x.test/{n}"));
            job.done();
        }
    }

    #[tokio::test]
    async fn test_schedule_after_close_fails() {
        let queue = MemoryQueue::new(8);
        queue.close().await.unwrap();
        queue.close().await.unwrap();
        let err = queue.schedule(JobContext::new(), request(0)).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn test_buffered_jobs_drain_after_close() {
        let queue = MemoryQueue::new(8);
        queue.schedule(JobContext::new(), request(0)).await.unwrap();
        queue.schedule(JobContext::new(), request(1)).await.unwrap();
        queue.close().await.unwrap();

        queue.get().await.unwrap().done();
        queue.get().await.unwrap().done();
        assert!(matches!(queue.get().await, Err(QueueError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_reentrant_schedule_keeps_queue_open() {
        let queue = MemoryQueue::new(8);
        queue.schedule(JobContext::new(), request(0)).await.unwrap();

        let job = queue.get().await.unwrap();
        // A handler scheduling follow-up work before its job is acknowledged.
        queue.schedule(JobContext::new(), request(1)).await.unwrap();
        job.done();
        assert!(!queue.is_closed());

        queue.get().await.unwrap().done();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_schedule_waits_for_capacity() {
        let queue = MemoryQueue::new(1);
        queue.schedule(JobContext::new(), request(0)).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.schedule(JobContext::new(), request(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let job = queue.get().await.unwrap();
        blocked.await.unwrap().unwrap();
        job.done();
        queue.get().await.unwrap().done();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_buffer_mode_never_auto_closes() {
        let queue = MemoryQueue::buffer(4);
        queue.schedule(JobContext::new(), request(0)).await.unwrap();
        queue.get().await.unwrap().done();
        assert!(!queue.is_closed());
        assert!(!queue.has_work());
    }

    #[tokio::test]
    async fn test_dropped_job_still_completes_accounting() {
        let queue = MemoryQueue::new(4);
        queue.schedule(JobContext::new(), request(0)).await.unwrap();
        drop(queue.get().await.unwrap());
        assert_eq!(queue.stats().in_flight, 0);
        assert!(queue.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_counters_settle_under_concurrency() {
        let queue = MemoryQueue::new(512);
        for n in 0..200 {
            queue.schedule(JobContext::new(), request(n)).await.unwrap();
        }

        let mut consumers = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            consumers.push(tokio::spawn(async move {
                let mut handled = 0usize;
                while let Ok(job) = queue.get().await {
                    // Every fourth job fans out one more, like a handler would.
                    let n: usize = job.request().url.rsplit('/').next().unwrap().parse().unwrap();
                    if n % 4 == 0 && n < 1000 {
                        queue
                            .schedule(JobContext::new(), request(n + 1000))
                            .await
                            .unwrap();
                    }
                    tokio::task::yield_now().await;
                    job.done();
                    handled += 1;
                }
                handled
            }));
        }

        let mut total = 0;
        for consumer in consumers {
            total += consumer.await.unwrap();
        }
        assert_eq!(total, 250);
        assert_eq!(
            queue.stats(),
            QueueStats {
                buffered: 0,
                in_flight: 0,
                done: 250
            }
        );
    }
}
