// src/errors.rs
// =============================================================================
// The completion channel.
//
// Workers report every queue error and every failed request here. Reporting
// never blocks: when the channel is full the error is dropped, logged at
// error level, and counted. The caller owns the receiving end and is
// expected to keep draining it for as long as the engine runs; a channel
// left full loses errors, it does not stall the workers.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error};

use crate::error::EngineError;

pub fn channel(capacity: usize) -> (ErrorSink, ErrorStream) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let sink = ErrorSink {
        sender,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sink, ErrorStream { receiver })
}

#[derive(Debug, Clone)]
pub struct ErrorSink {
    sender: mpsc::Sender<EngineError>,
    dropped: Arc<AtomicU64>,
}

impl ErrorSink {
    pub fn report(&self, err: EngineError) {
        match self.sender.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "completion channel full; error dropped");
            }
            Err(TrySendError::Closed(err)) => {
                debug!(error = %err, "completion channel has no reader; error dropped");
            }
        }
    }

    /// Errors lost to a full channel so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of the completion channel. Ends once the engine and its
/// workers are gone.
#[derive(Debug)]
pub struct ErrorStream {
    receiver: mpsc::Receiver<EngineError>,
}

impl ErrorStream {
    pub async fn recv(&mut self) -> Option<EngineError> {
        self.receiver.recv().await
    }

    /// Returns a buffered error without waiting.
    pub fn try_recv(&mut self) -> Option<EngineError> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    #[tokio::test]
    async fn test_report_and_receive() {
        let (sink, mut stream) = channel(4);
        sink.report(QueueError::Closed.into());
        let err = stream.recv().await.unwrap();
        assert!(matches!(err, EngineError::Queue(QueueError::Closed)));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (sink, mut stream) = channel(2);
        for _ in 0..5 {
            sink.report(QueueError::EndOfStream.into());
        }
        assert_eq!(sink.dropped(), 3);
        assert!(stream.try_recv().is_some());
        assert!(stream.try_recv().is_some());
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_with_last_sink() {
        let (sink, mut stream) = channel(2);
        let clone = sink.clone();
        drop(sink);
        clone.report(QueueError::Closed.into());
        drop(clone);
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}
