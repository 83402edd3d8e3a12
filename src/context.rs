// src/context.rs
// =============================================================================
// Per-job execution context.
//
// Every job carries one of these next to its request. It holds:
// - a cancellation token (cancelling it stops only this job)
// - an optional deadline
// - proxy addresses to route this job through
// - free-form string metadata (trace ids, crawl depth, ...)
//
// Cloning is cheap and clones share the same cancellation token.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    proxies: Arc<Vec<String>>,
    metadata: BTreeMap<String, String>,
}

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for work spawned from this job: cancelled together with the
    /// parent, same deadline, proxies and metadata.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            proxies: Arc::clone(&self.proxies),
            metadata: self.metadata.clone(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Keeps the earlier of the current and the new deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_proxies<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut proxies: Vec<String> = self.proxies.iter().cloned().collect();
        proxies.extend(addrs.into_iter().map(Into::into));
        self.proxies = Arc::new(proxies);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata_map(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
