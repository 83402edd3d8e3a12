// src/engine.rs
// =============================================================================
// The engine: explicit composition of queue, pipeline, admission control and
// completion channel.
//
// Typical use:
//   let engine = Engine::new(EngineOptions::default())?;
//   engine.register("page", |ctx, response| async move { ... })?;
//   engine.schedule(JobContext::new(), Request::new(url).with_callback("page")).await?;
//   engine.run().await;
//
// Handlers that need to schedule follow-up work capture `engine.scheduler()`,
// a cloneable handle to the same queue.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Client;
use tracing::info;

use crate::admission::AdmissionController;
use crate::config::EngineOptions;
use crate::context::JobContext;
use crate::error::{BoxError, ConfigError, CrawlError, QueueError};
use crate::errors::{self, ErrorSink, ErrorStream};
use crate::pipeline::Pipeline;
use crate::pool::{WorkerContext, WorkerPool};
use crate::queue::{MemoryQueue, Queue};
use crate::registry::{self, Registry};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

#[derive(Default)]
pub struct EngineBuilder {
    options: EngineOptions,
    queue: Option<Arc<dyn Queue>>,
    client: Option<Client>,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses `queue` instead of a `MemoryQueue` of `queue_capacity` slots.
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Uses `client` as the shared HTTP client.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        let options = self.options;
        options.validate()?;

        let transport = match self.client {
            Some(client) => Transport::with_client(client, options.transport.clone(), options.timeout),
            None => Transport::new(options.transport.clone(), options.timeout)?,
        };
        let registry = Arc::new(Registry::new(options.dispatch));
        let pipeline = Arc::new(Pipeline::new(transport, Arc::clone(&registry), options.header_map()?));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryQueue::new(options.queue_capacity)));
        let admission = Arc::new(AdmissionController::new(options.rate_limit()?));
        let (sink, stream) = errors::channel(options.error_capacity);

        Ok(Engine {
            options,
            queue,
            registry,
            pipeline,
            admission,
            errors: sink,
            stream: Mutex::new(Some(stream)),
        })
    }
}

pub struct Engine {
    options: EngineOptions,
    queue: Arc<dyn Queue>,
    registry: Arc<Registry>,
    pipeline: Arc<Pipeline>,
    admission: Arc<AdmissionController>,
    errors: ErrorSink,
    stream: Mutex<Option<ErrorStream>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Result<Self, ConfigError> {
        Self::builder().options(options).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Registers a handler under an exact callback name or a glob pattern.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(JobContext, Arc<Response>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.registry.register(name, registry::handler(handler))
    }

    pub fn middleware<F>(&self, middleware: F)
    where
        F: Fn(&JobContext, &Request, &mut reqwest::Request) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.registry.add_middleware(registry::middleware(middleware));
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Enqueues a request. Waits while the queue is full.
    pub async fn schedule(&self, ctx: JobContext, request: Request) -> Result<(), QueueError> {
        self.queue.schedule(ctx, request).await
    }

    /// A handle for scheduling from inside handlers.
    pub fn scheduler(&self) -> Arc<dyn Queue> {
        Arc::clone(&self.queue)
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Runs one request through the pipeline right away, bypassing the queue
    /// and admission control.
    pub async fn execute(&self, ctx: JobContext, request: Request) -> Result<Arc<Response>, CrawlError> {
        self.pipeline.execute(&ctx, Arc::new(request)).await
    }

    /// Starts the workers. They run until the queue reports end of stream or
    /// the pool is shut down. The default memory queue ends the stream as soon
    /// as a worker finds nothing outstanding, so schedule seed requests first.
    pub fn start(&self) -> WorkerPool {
        let context = Arc::new(WorkerContext {
            queue: Arc::clone(&self.queue),
            admission: Arc::clone(&self.admission),
            pipeline: Arc::clone(&self.pipeline),
            errors: self.errors.clone(),
        });
        WorkerPool::spawn(self.options.concurrency, context)
    }

    /// Starts the workers and waits for all of them to finish.
    pub async fn run(&self) {
        self.start().wait().await;
    }

    /// Stops releasing jobs to workers. In-flight jobs keep running.
    pub fn freeze(&self) {
        if self.admission.freeze() {
            info!("engine frozen");
        }
    }

    pub fn unfreeze(&self) {
        if self.admission.unfreeze() {
            info!("engine unfrozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.admission.is_frozen()
    }

    /// Closes the queue; already buffered jobs may still drain.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.queue.close().await
    }

    /// The completion channel. Handed out once; later calls return `None`.
    /// Drain it while the engine runs, or errors are dropped once it fills up.
    pub fn errors(&self) -> Option<ErrorStream> {
        self.stream.lock().take()
    }

    /// Errors dropped because the completion channel was full.
    pub fn dropped_errors(&self) -> u64 {
        self.errors.dropped()
    }
}
