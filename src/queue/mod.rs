// src/queue/mod.rs
// =============================================================================
// The job queue contract.
//
// A Queue hands Jobs to workers. Any backend works as long as it can:
// - schedule a request (from anywhere, including from inside a handler)
// - give out the next job, or EndOfStream once no job will ever come again
// - close (idempotent; buffered jobs may still drain)
//
// Backends:
// - memory: bounded in-process channel, closes itself once drained
// - bus: publishes to a message bus and buffers consumed messages locally
// - loopback: an in-process message bus for the bus queue
// =============================================================================

mod bus;
mod loopback;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::context::JobContext;
use crate::error::QueueError;
use crate::request::Request;

pub use bus::{BusMessage, BusQueue, Envelope, Publisher};
pub use loopback::{DeliveryStats, LoopbackBus, LoopbackMessage};
pub use memory::{MemoryQueue, QueueStats};

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues a request. Waits for capacity when the backend is bounded.
    async fn schedule(&self, ctx: JobContext, request: Request) -> Result<(), QueueError>;

    /// Waits for the next job. `QueueError::EndOfStream` means the queue is exhausted.
    async fn get(&self) -> Result<Job, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Backend-side completion of a job.
pub trait Acknowledge: Send {
    /// The job finished, successfully or not.
    fn done(self: Box<Self>);

    /// The job was dropped without `done()`. Backends that can redeliver should.
    fn abandon(self: Box<Self>) {
        self.done()
    }
}

/// A request, its context and a one-shot completion signal.
///
/// `done` consumes the job so it cannot be acknowledged twice. A job dropped
/// without `done` is a bug in the consumer: it is logged and abandoned.
pub struct Job {
    request: Arc<Request>,
    context: JobContext,
    ack: Option<Box<dyn Acknowledge>>,
}

impl Job {
    pub fn new(context: JobContext, request: Request) -> Self {
        Self {
            request: Arc::new(request),
            context,
            ack: None,
        }
    }

    pub fn with_ack(mut self, ack: Box<dyn Acknowledge>) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn done(mut self) {
        if let Some(ack) = self.ack.take() {
            ack.done();
        }
    }

    /// Returns the job to the backend without completing it.
    pub fn abandon(mut self) {
        if let Some(ack) = self.ack.take() {
            ack.abandon();
        }
    }

    pub(crate) fn take_ack(&mut self) -> Option<Box<dyn Acknowledge>> {
        self.ack.take()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("request", &self.request)
            .field("acknowledged", &self.ack.is_none())
            .finish()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            error!(request = %self.request, "job dropped without done(); abandoning it");
            ack.abandon();
        }
    }
}
