// src/cli.rs
// =============================================================================
// This file defines our command-line interface using the `clap` crate.
//
// The binary is a small spider on top of the engine: it schedules the given
// URLs, registers a few handlers and prints what it visited. Every flag that
// maps onto an engine option overrides the value from --config.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crawl_engine::{DispatchMode, EngineOptions, RateLimit};

#[derive(Parser, Debug)]
#[command(
    name = "crawl-engine",
    version,
    about = "Crawl websites concurrently with rate limits and handler dispatch",
    long_about = "crawl-engine schedules the given URLs on a concurrent, rate-limited worker pool. \
                  Each response is dispatched to the handlers named by --callback: \
                  'page' records status and title, 'links' follows same-domain links \
                  and 'dump' records raw responses."
)]
pub struct Cli {
    /// Start URLs
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Handlers to run on every response (default: page + links, or dump with --raw)
    #[arg(long = "callback", value_name = "NAME")]
    pub callbacks: Vec<String>,

    /// Maximum crawl depth; 1 = only the start URLs
    #[arg(long, default_value_t = 1)]
    pub max_depth: usize,

    /// Number of workers
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Maximum requests per second
    #[arg(long, conflicts_with = "rpm")]
    pub rps: Option<u32>,

    /// Maximum requests per minute
    #[arg(long)]
    pub rpm: Option<u32>,

    /// Per-request timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Extra header sent with every request, as NAME=VALUE
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    pub headers: Vec<(String, String)>,

    /// Form value for the start requests, as KEY=VALUE
    #[arg(long = "form", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub form: Vec<(String, String)>,

    /// HTTP method for the start requests
    #[arg(long)]
    pub method: Option<String>,

    /// Proxy address; one is picked at random per request
    #[arg(long = "proxy", value_name = "ADDR")]
    pub proxies: Vec<String>,

    /// Skip HTML parsing
    #[arg(long)]
    pub raw: bool,

    /// Skip callbacks that have no handler instead of failing the request
    #[arg(long)]
    pub permissive: bool,

    /// Output results in JSON format instead of a table
    #[arg(long)]
    pub json: bool,

    /// JSON file with engine options
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Options from --config (or defaults) with flag overrides applied.
    pub fn engine_options(&self) -> Result<EngineOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str::<EngineOptions>(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => EngineOptions::default(),
        };

        if let Some(workers) = self.concurrency {
            options = options.with_concurrency(workers);
        }
        if let Some(n) = self.rps {
            options = options.with_rate_limit(RateLimit::PerSecond(n));
        }
        if let Some(n) = self.rpm {
            options = options.with_rate_limit(RateLimit::PerMinute(n));
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        for (name, value) in &self.headers {
            options = options.with_header(name.as_str(), value.as_str());
        }
        if self.permissive {
            options = options.with_dispatch(DispatchMode::Permissive);
        }
        // Every start URL must fit in the queue before the workers start.
        options.queue_capacity = options.queue_capacity.max(self.urls.len());
        Ok(options)
    }

    /// Callback names for every request.
    pub fn callbacks(&self) -> Vec<String> {
        if !self.callbacks.is_empty() {
            return self.callbacks.clone();
        }
        if self.raw {
            vec!["dump".to_string()]
        } else {
            vec!["page".to_string(), "links".to_string()]
        }
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("q=rust"), Ok(("q".into(), "rust".into())));
        assert_eq!(parse_key_value("a=b=c"), Ok(("a".into(), "b=c".into())));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "crawl-engine",
            "https://example.com",
            "--concurrency",
            "4",
            "--rpm",
            "30",
            "--timeout-ms",
            "2500",
            "--header",
            "User-Agent=test-agent",
            "--permissive",
        ]);
        let options = cli.engine_options().unwrap();
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.rate_limit().unwrap(), Some(RateLimit::PerMinute(30)));
        assert_eq!(options.timeout, Duration::from_millis(2500));
        assert_eq!(options.headers["User-Agent"], "test-agent");
        assert_eq!(options.dispatch, DispatchMode::Permissive);
    }

    #[test]
    fn test_rate_flags_conflict() {
        let result = Cli::try_parse_from(["crawl-engine", "https://x.test", "--rps", "1", "--rpm", "1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_callbacks() {
        let cli = Cli::parse_from(["crawl-engine", "https://x.test"]);
        assert_eq!(cli.callbacks(), ["page", "links"]);

        let cli = Cli::parse_from(["crawl-engine", "https://x.test", "--raw"]);
        assert_eq!(cli.callbacks(), ["dump"]);

        let cli = Cli::parse_from(["crawl-engine", "https://x.test", "--callback", "page"]);
        assert_eq!(cli.callbacks(), ["page"]);
    }
}

// -----------------------------------------------------------------------------
// NOTES:
//
// 1. value_parser = parse_key_value
//    - clap calls our function for every occurrence of the flag
//    - returning Err(String) makes clap print a usage error and exit
//
// 2. conflicts_with = "rpm"
//    - the engine accepts only one rate window, so clap rejects both flags
//      before we ever build options
// -----------------------------------------------------------------------------
