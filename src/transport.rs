// src/transport.rs
// =============================================================================
// HTTP clients.
//
// One shared reqwest client serves every job. Its connection pool and cookie
// jar are shared by all workers (reqwest does its own locking). A job whose
// context lists proxies gets a private client bound to one of them, picked
// uniformly at random, and that client is dropped when the call ends.
// =============================================================================

use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder, Proxy};
use tracing::debug;

use crate::config::TransportOptions;
use crate::error::{ConfigError, CrawlError};

#[derive(Debug, Clone)]
pub struct Transport {
    shared: Client,
    options: TransportOptions,
    timeout: Duration,
}

impl Transport {
    pub fn new(options: TransportOptions, timeout: Duration) -> Result<Self, ConfigError> {
        let shared = builder(&options, timeout)
            .cookie_store(options.cookie_store)
            .build()?;
        Ok(Self {
            shared,
            options,
            timeout,
        })
    }

    /// Uses a caller-built client as the shared one. Proxy clients are still
    /// built from `options`.
    pub fn with_client(client: Client, options: TransportOptions, timeout: Duration) -> Self {
        Self {
            shared: client,
            options,
            timeout,
        }
    }

    pub fn shared(&self) -> &Client {
        &self.shared
    }

    /// The client for one call: the shared one, or a private proxy client.
    pub fn select(&self, proxies: &[String]) -> Result<Client, CrawlError> {
        let Some(addr) = proxies.choose(&mut rand::thread_rng()) else {
            return Ok(self.shared.clone());
        };
        debug!(proxy = %addr, "using proxy transport");
        self.proxy_client(addr)
    }

    fn proxy_client(&self, addr: &str) -> Result<Client, CrawlError> {
        let invalid = |reason: String| CrawlError::Proxy {
            addr: addr.to_string(),
            reason,
        };
        let proxy = Proxy::all(proxy_url(addr)).map_err(|e| invalid(e.to_string()))?;
        builder(&self.options, self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| invalid(e.to_string()))
    }
}

fn builder(options: &TransportOptions, timeout: Duration) -> ClientBuilder {
    let redirect = match options.max_redirects {
        0 => Policy::none(),
        n => Policy::limited(n),
    };
    Client::builder()
        .timeout(timeout)
        .connect_timeout(options.connect_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .redirect(redirect)
}

// Bare "host:port" addresses are taken as plain HTTP proxies.
fn proxy_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}
