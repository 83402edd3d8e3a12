// src/config.rs
// =============================================================================
// Engine options.
//
// Everything is optional and has a default. Options can be built in code with
// the with_* setters or loaded from JSON (missing fields take their defaults).
// validate() runs once when the engine is built; nothing starts on bad input.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::admission::RateLimit;
use crate::error::ConfigError;
use crate::request::{header_name, header_value};

/// Headers sent with every request unless the request sets them itself.
pub const DEFAULT_HEADERS: [(&str, &str); 3] = [
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    ),
    ("Accept-Language", "en-US,en;q=0.8"),
    (
        "User-Agent",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/46.0.2490.86 Safari/537.36",
    ),
];

/// What to do with a callback name that has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Fail the job with `UnhandledCallback` before any handler runs.
    #[default]
    Strict,
    /// Log a warning and run whatever handlers did match.
    Permissive,
}

/// Settings for the shared HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Redirects followed per request; 0 disables redirects.
    pub max_redirects: usize,

    pub pool_max_idle_per_host: usize,

    /// Keep cookies between requests on the shared client.
    pub cookie_store: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
            pool_max_idle_per_host: 32,
            cookie_store: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Slots in the default in-memory queue.
    pub queue_capacity: usize,

    /// Number of workers.
    pub concurrency: usize,

    /// Slots in the completion channel.
    pub error_capacity: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_second: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,

    /// Per-request timeout, applied by the shared client.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    pub headers: BTreeMap<String, String>,

    pub dispatch: DispatchMode,

    pub transport: TransportOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            concurrency: 100,
            error_capacity: 10_000,
            max_requests_per_second: None,
            max_requests_per_minute: None,
            timeout: Duration::from_secs(30),
            headers: DEFAULT_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            dispatch: DispatchMode::default(),
            transport: TransportOptions::default(),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Replaces any previously configured rate limit.
    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.max_requests_per_second = None;
        self.max_requests_per_minute = None;
        match limit {
            RateLimit::PerSecond(n) => self.max_requests_per_second = Some(n),
            RateLimit::PerMinute(n) => self.max_requests_per_minute = Some(n),
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds or replaces one default header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces the whole default header set.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    /// The configured rate limit, if any.
    pub fn rate_limit(&self) -> Result<Option<RateLimit>, ConfigError> {
        let limit = match (self.max_requests_per_second, self.max_requests_per_minute) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingRateLimits),
            (Some(0), None) => return Err(ConfigError::Zero("max_requests_per_second")),
            (None, Some(0)) => return Err(ConfigError::Zero("max_requests_per_minute")),
            (Some(n), None) => RateLimit::PerSecond(n),
            (None, Some(n)) => RateLimit::PerMinute(n),
            (None, None) => return Ok(None),
        };
        // The ticker needs a non-zero period.
        if limit.period().is_zero() {
            return Err(ConfigError::RateTooHigh {
                permits: limit.permits(),
                window: limit.window(),
            });
        }
        Ok(Some(limit))
    }

    /// Default headers as a header map.
    pub fn header_map(&self) -> Result<HeaderMap, ConfigError> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let invalid = || ConfigError::InvalidHeader(name.clone());
            let name = header_name(name).map_err(|_| invalid())?;
            let value = header_value(name.as_str(), value).map_err(|_| invalid())?;
            map.insert(name, value);
        }
        Ok(map)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        if self.error_capacity == 0 {
            return Err(ConfigError::Zero("error_capacity"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Zero("timeout"));
        }
        self.rate_limit()?;
        self.header_map()?;
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
