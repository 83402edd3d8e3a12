// src/pool.rs
// =============================================================================
// The worker pool.
//
// Each worker loops:
// 1. queue.get()        - next job, or EndOfStream
// 2. admission.admit()  - freeze gate, then a rate permit
// 3. pipeline.execute() - failures go to the completion channel
// 4. job.done()         - always, whatever the pipeline returned
//
// Permits are only taken with a job in hand, so an idle or frozen pool never
// sits on permits that would all be spent at once when work shows up.
//
// A worker exits on EndOfStream, on any other queue error (reported first),
// or on shutdown. A job still waiting for admission when shutdown comes is
// handed back to the queue; a job that reached the pipeline always runs to
// completion. The first worker to see EndOfStream wakes the others.
// =============================================================================

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::admission::AdmissionController;
use crate::error::{EngineError, QueueError, RequestError};
use crate::errors::ErrorSink;
use crate::pipeline::Pipeline;
use crate::queue::Queue;

/// Everything a worker needs, shared by all of them.
pub struct WorkerContext {
    pub queue: Arc<dyn Queue>,
    pub admission: Arc<AdmissionController>,
    pub pipeline: Arc<Pipeline>,
    pub errors: ErrorSink,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(workers: usize, context: Arc<WorkerContext>) -> Self {
        let shutdown = CancellationToken::new();
        let exhausted = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|id| {
                let stop = Stop {
                    shutdown: shutdown.clone(),
                    exhausted: exhausted.clone(),
                };
                tokio::spawn(run_worker(id, Arc::clone(&context), stop))
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "worker pool started");
        Self { handles, shutdown }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Token that stops the pool when cancelled. Same effect as `shutdown()`
    /// without waiting.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Waits until every worker has exited.
    pub async fn wait(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }

    /// Asks every worker to stop after its current job, then waits for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait().await;
    }
}

struct Stop {
    shutdown: CancellationToken,
    exhausted: CancellationToken,
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, stop: Stop) {
    debug!(worker = id, "worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.shutdown.cancelled() => break,
            _ = stop.exhausted.cancelled() => break,
            next = ctx.queue.get() => next,
        };
        let job = match next {
            Ok(job) => job,
            Err(QueueError::EndOfStream) => {
                stop.exhausted.cancel();
                break;
            }
            Err(e) => {
                ctx.errors.report(EngineError::Queue(e));
                break;
            }
        };

        // An open gate wins over a pending shutdown.
        let released = tokio::select! {
            biased;
            _ = ctx.admission.admit() => true,
            _ = stop.shutdown.cancelled() => false,
        };
        if !released {
            debug!(worker = id, request = %job.request(), "shutdown before admission; returning job");
            job.abandon();
            break;
        }

        let request = Arc::clone(job.request());
        if let Err(source) = ctx.pipeline.execute(job.context(), Arc::clone(&request)).await {
            debug!(worker = id, request = %request, error = %source, "request failed");
            ctx.errors.report(RequestError { request, source }.into());
        }
        job.done();
    }
    debug!(worker = id, "worker stopped");
}
