// src/queue/loopback.rs
// =============================================================================
// In-process message bus.
//
// Published bodies go straight into a channel whose receiver is handed to
// BusQueue::consume. Useful for single-process runs and for exercising the
// bus queue without an external broker. Counts how each message ended.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use super::bus::{BusMessage, Publisher};
use crate::error::QueueError;

type MessageSender = mpsc::Sender<Box<dyn BusMessage>>;

#[derive(Debug, Default)]
pub struct DeliveryStats {
    published: AtomicUsize,
    finished: AtomicUsize,
    requeued: AtomicUsize,
    given_up: AtomicUsize,
}

impl DeliveryStats {
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.requeued.load(Ordering::SeqCst)
    }

    pub fn given_up(&self) -> usize {
        self.given_up.load(Ordering::SeqCst)
    }
}

pub struct LoopbackBus {
    sender: Mutex<Option<MessageSender>>,
    stats: Arc<DeliveryStats>,
}

impl LoopbackBus {
    /// Returns the bus and the receiving end to feed into a consumer.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Box<dyn BusMessage>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let bus = Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            stats: Arc::new(DeliveryStats::default()),
        });
        (bus, receiver)
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Publishes a raw body, bypassing envelope encoding.
    pub async fn publish_raw(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let sender = self.sender.lock().clone().ok_or(QueueError::Closed)?;
        let message = LoopbackMessage {
            body,
            bus: sender.downgrade(),
            stats: Arc::clone(&self.stats),
        };
        sender
            .send(Box::new(message))
            .await
            .map_err(|_| QueueError::Bus("loopback receiver dropped".into()))?;
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Publisher for LoopbackBus {
    async fn publish(&self, _topic: &str, body: Vec<u8>) -> Result<(), QueueError> {
        self.publish_raw(body).await
    }

    async fn stop(&self) {
        self.sender.lock().take();
    }
}

pub struct LoopbackMessage {
    body: Vec<u8>,
    bus: mpsc::WeakSender<Box<dyn BusMessage>>,
    stats: Arc<DeliveryStats>,
}

impl BusMessage for LoopbackMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn finish(self: Box<Self>) {
        self.stats.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn requeue(self: Box<Self>) {
        let stats = Arc::clone(&self.stats);
        let Some(bus) = self.bus.upgrade() else {
            warn!("loopback bus stopped; dropping requeued message");
            stats.given_up.fetch_add(1, Ordering::SeqCst);
            return;
        };
        match bus.try_send(self) {
            Ok(()) => {
                stats.requeued.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {
                warn!("loopback bus full; dropping requeued message");
                stats.given_up.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn give_up(self: Box<Self>) {
        self.stats.given_up.fetch_add(1, Ordering::SeqCst);
    }
}
