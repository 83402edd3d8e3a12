// src/lib.rs
// =============================================================================
// crawl-engine: a programmable job-scheduling engine for concurrent,
// rate-limited HTTP requests.
//
// Module map:
// - request / response / document: what goes out, what comes back
// - form: filling in a page's forms and submitting them as requests
// - context: per-job cancellation, deadline, proxies and metadata
// - queue: the job queue contract plus memory and message-bus backends
// - admission: rate limiting and the freeze gate
// - registry: callback-name to handler routing, middlewares
// - transport / pipeline: one request from build to handler dispatch
// - pool / errors: the workers and the completion channel they report to
// - engine: all of the above wired together
// =============================================================================

pub mod admission;
pub mod config;
pub mod context;
pub mod document;
pub mod engine;
pub mod error;
pub mod errors;
pub mod form;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod request;
pub mod response;
pub mod transport;

pub use admission::RateLimit;
pub use config::{DispatchMode, EngineOptions, TransportOptions};
pub use context::JobContext;
pub use document::Document;
pub use engine::{Engine, EngineBuilder};
pub use error::{BoxError, ConfigError, CrawlError, DocumentError, EngineError, QueueError, RequestError};
pub use errors::ErrorStream;
pub use form::Form;
pub use pool::WorkerPool;
pub use queue::{Job, MemoryQueue, Queue};
pub use registry::{Handler, Middleware};
pub use request::Request;
pub use response::Response;
