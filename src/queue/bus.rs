// src/queue/bus.rs
// =============================================================================
// Message-bus backed queue.
//
// How it works:
// 1. schedule() wraps the request in an Envelope and publishes it to a topic
// 2. The bus pushes messages back to us through deliver() (or consume())
// 3. Each message is decoded into a Job and parked in a local MemoryQueue
// 4. Workers pull from the local buffer with get(), like any other queue
// 5. Job::done() finishes the remote message; an abandoned job is requeued
//
// The local buffer turns the bus's push-style consumer callback into the
// pull-style get() the worker pool expects.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Acknowledge, Job, MemoryQueue, Queue};
use crate::context::JobContext;
use crate::error::QueueError;
use crate::request::Request;

/// Outgoing side of a message bus.
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), QueueError>;

    /// Flushes and disconnects. Called once from `BusQueue::close`.
    async fn stop(&self) {}
}

/// A message received from the bus.
pub trait BusMessage: Send + 'static {
    fn body(&self) -> &[u8];

    /// Processing finished; the bus may forget the message.
    fn finish(self: Box<Self>);

    /// Redeliver the message, possibly to another consumer.
    fn requeue(self: Box<Self>);

    /// Drop the message for good.
    fn give_up(self: Box<Self>);
}

/// Wire format of a scheduled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request: Request,

    /// Absolute deadline in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<String>,
}

impl Envelope {
    pub fn new(ctx: &JobContext, request: Request) -> Self {
        let deadline_ms = ctx.deadline().map(|deadline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            unix_millis(SystemTime::now() + remaining)
        });
        Self {
            request,
            deadline_ms,
            metadata: ctx.metadata_map().clone(),
            proxies: ctx.proxies().to_vec(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|d| d.is_zero())
    }

    /// Time left before the deadline; `None` without one.
    fn remaining(&self) -> Option<Duration> {
        self.deadline_ms.map(|ms| {
            let deadline = UNIX_EPOCH + Duration::from_millis(ms);
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Rebuilds the job context on the consuming side.
    pub fn into_parts(self) -> (JobContext, Request) {
        let mut ctx = JobContext::new().with_proxies(self.proxies.iter().cloned());
        if let Some(remaining) = self.remaining() {
            ctx = ctx.with_timeout(remaining);
        }
        for (key, value) in &self.metadata {
            ctx = ctx.with_metadata(key.as_str(), value.as_str());
        }
        (ctx, self.request)
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct BusAck(Box<dyn BusMessage>);

impl Acknowledge for BusAck {
    fn done(self: Box<Self>) {
        self.0.finish();
    }

    fn abandon(self: Box<Self>) {
        self.0.requeue();
    }
}

pub struct BusQueue<P: Publisher> {
    publisher: Arc<P>,
    topic: String,
    local: MemoryQueue,
}

impl<P: Publisher> BusQueue<P> {
    /// `max_in_flight` bounds how many consumed messages wait locally.
    pub fn new(publisher: Arc<P>, topic: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            local: MemoryQueue::buffer(max_in_flight + 1),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer callback: decodes one message and buffers it for the workers.
    pub async fn deliver(&self, message: Box<dyn BusMessage>) {
        let envelope: Envelope = match serde_json::from_slice(message.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "undecodable bus message; giving up");
                message.give_up();
                return;
            }
        };
        if envelope.is_expired() {
            debug!(request = %envelope.request, "bus message past its deadline; giving up");
            message.give_up();
            return;
        }

        let (ctx, request) = envelope.into_parts();
        let job = Job::new(ctx, request).with_ack(Box::new(BusAck(message)));
        // A closed buffer abandons the job, which requeues the message.
        if let Err(e) = self.local.push(job).await {
            debug!(topic = %self.topic, error = %e, "bus message returned to the bus");
        }
    }

    /// Spawns a task feeding every message from `messages` into `deliver`.
    pub fn consume(self: &Arc<Self>, mut messages: mpsc::Receiver<Box<dyn BusMessage>>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                queue.deliver(message).await;
            }
            debug!(topic = %queue.topic, "bus consumer finished");
        })
    }

    pub fn local(&self) -> &MemoryQueue {
        &self.local
    }
}

#[async_trait]
impl<P: Publisher> Queue for BusQueue<P> {
    async fn schedule(&self, ctx: JobContext, request: Request) -> Result<(), QueueError> {
        if self.local.is_closed() {
            return Err(QueueError::Closed);
        }
        let body = serde_json::to_vec(&Envelope::new(&ctx, request))?;
        self.publisher.publish(&self.topic, body).await
    }

    async fn get(&self) -> Result<Job, QueueError> {
        self.local.get().await
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.local.is_closed() {
            return Ok(());
        }
        self.local.close().await?;
        self.publisher.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::LoopbackBus;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_schedule_consume_done_finishes_message() {
        let (bus, messages) = LoopbackBus::new(16);
        let queue = Arc::new(BusQueue::new(Arc::clone(&bus), "crawl_requests", 4));
        let consumer = queue.consume(messages);

        let ctx = JobContext::new()
            .with_metadata("trace", "abc")
            .with_proxies(["127.0.0.1:3128"]);
        queue
            .schedule(ctx, Request::new("http://x.test/").with_callback("page"))
            .await
            .unwrap();

        let job = queue.get().await.unwrap();
        assert_eq!(job.request().callbacks, vec!["page".to_string()]);
        assert_eq!(job.context().metadata("trace"), Some("abc"));
        assert_eq!(job.context().proxies(), ["127.0.0.1:3128".to_string()]);
        job.done();

        assert_eq!(bus.stats().published(), 1);
        assert_eq!(bus.stats().finished(), 1);

        queue.close().await.unwrap();
        consumer.await.unwrap();
        assert!(matches!(queue.get().await, Err(QueueError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_expired_envelope_is_given_up() {
        let (bus, messages) = LoopbackBus::new(16);
        let queue = Arc::new(BusQueue::new(Arc::clone(&bus), "t", 4));
        let _consumer = queue.consume(messages);

        let envelope = Envelope {
            request: Request::new("http://x.test/"),
            deadline_ms: Some(unix_millis(SystemTime::now()) - 1_000),
            metadata: BTreeMap::new(),
            proxies: Vec::new(),
        };
        bus.publish_raw(serde_json::to_vec(&envelope).unwrap()).await.unwrap();
        bus.publish_raw(b"not json".to_vec()).await.unwrap();

        wait_for(|| bus.stats().given_up() == 2).await;
        assert_eq!(queue.local().stats().buffered, 0);
    }

    #[tokio::test]
    async fn test_abandoned_job_is_requeued() {
        let (bus, messages) = LoopbackBus::new(16);
        let queue = Arc::new(BusQueue::new(Arc::clone(&bus), "t", 4));
        let _consumer = queue.consume(messages);

        queue.schedule(JobContext::new(), Request::new("http://x.test/")).await.unwrap();
        queue.get().await.unwrap().abandon();
        assert_eq!(bus.stats().requeued(), 1);

        // Redelivered through the bus and handed out again.
        let job = queue.get().await.unwrap();
        job.done();
        assert_eq!(bus.stats().finished(), 1);
    }

    #[tokio::test]
    async fn test_schedule_after_close_fails() {
        let (bus, _messages) = LoopbackBus::new(16);
        let queue = BusQueue::new(bus, "t", 4);
        queue.close().await.unwrap();
        let err = queue
            .schedule(JobContext::new(), Request::new("http://x.test/"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }

    #[tokio::test]
    async fn test_envelope_carries_deadline() {
        let ctx = JobContext::new().with_timeout(Duration::from_secs(60));
        let envelope = Envelope::new(&ctx, Request::new("http://x.test/"));
        assert!(!envelope.is_expired());

        let (ctx, _) = envelope.into_parts();
        let remaining = ctx.deadline().unwrap() - Instant::now();
        assert!(remaining > Duration::from_secs(55));
        assert!(remaining <= Duration::from_secs(60));
    }
}
