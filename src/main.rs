// src/main.rs
// =============================================================================
// This is the entry point of the crawl-engine CLI.
//
// What happens here:
// 1. Parse command-line arguments and build engine options
// 2. Build the engine and register the spider's handlers
// 3. Schedule the start URLs and run the workers until the queue drains
// 4. Drain the completion channel to stderr while the workers run
// 5. Print the report and exit (0 = all good, 1 = failures, 2 = fatal error)
// =============================================================================

mod cli;
mod site;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use crawl_engine::{Engine, JobContext, Request};
use site::{PageRecord, Spider};

#[tokio::main]
async fn main() {
    init_tracing();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

// RUST_LOG wins when set. Otherwise CRAWL_DEBUG=1 turns on debug output for
// the engine and everything else stays at warn.
fn init_tracing() {
    let debug = std::env::var("CRAWL_DEBUG").is_ok_and(|v| !v.is_empty() && v != "0");
    let fallback = if debug { "warn,crawl_engine=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Serialize)]
struct Report {
    pages: Vec<PageRecord>,
    errors: Vec<String>,
    dropped_errors: u64,
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let options = cli.engine_options()?;
    let engine = Engine::new(options).context("invalid engine options")?;

    let spider = Spider::new(engine.scheduler(), cli.max_depth);
    spider.register(&engine)?;

    let mut errors = engine
        .errors()
        .ok_or_else(|| anyhow!("completion channel already taken"))?;
    let drain = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(err) = errors.recv().await {
            eprintln!("  ⚠️  {}", err);
            seen.push(err.to_string());
        }
        seen
    });

    let callbacks = cli.callbacks();
    for url in &cli.urls {
        let mut request = Request::new(url.as_str())
            .with_callbacks(callbacks.iter().cloned())
            .with_raw(cli.raw);
        if let Some(method) = &cli.method {
            request = request.with_method(method.as_str());
        }
        for (key, value) in &cli.form {
            request = request.with_form_value(key.as_str(), value.as_str());
        }
        let ctx = spider.seed(url, JobContext::new().with_proxies(cli.proxies.iter().cloned()));
        engine
            .schedule(ctx, request)
            .await
            .with_context(|| format!("scheduling {}", url))?;
    }

    eprintln!("🔍 Crawling {} start URL(s), max depth {}", cli.urls.len(), cli.max_depth);
    engine.run().await;

    let dropped_errors = engine.dropped_errors();
    // The engine holds the last error sender; dropping it ends the drain.
    drop(engine);
    let errors = drain.await.context("error drain task failed")?;

    let report = Report {
        pages: spider.pages(),
        errors,
        dropped_errors,
    };
    print_report(&report, cli.json)?;

    let failed = !report.errors.is_empty()
        || report.dropped_errors > 0
        || report.pages.iter().any(|p| !p.is_ok());
    Ok(if failed { 1 } else { 0 })
}

// Prints the report either as a table or JSON
fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print_table(report);
    }
    Ok(())
}

fn print_table(report: &Report) {
    println!("{:<60} {:<8} {:<6} {:<30}", "URL", "STATUS", "DEPTH", "TITLE");
    println!("{}", "=".repeat(107));

    for page in &report.pages {
        let url_display = if page.url.len() > 57 {
            format!("{}...", &page.url[..57])
        } else {
            page.url.clone()
        };
        let detail = match (&page.title, page.bytes) {
            (Some(title), _) => title.clone(),
            (None, Some(bytes)) => format!("{} bytes", bytes),
            (None, None) => String::new(),
        };
        println!("{:<60} {:<8} {:<6} {:<30}", url_display, page.status, page.depth, detail);
    }

    println!();

    let ok_count = report.pages.iter().filter(|p| p.is_ok()).count();
    println!("📊 Summary:");
    println!("   ✅ OK: {}", ok_count);
    println!("   ❌ HTTP errors: {}", report.pages.len() - ok_count);
    println!("   ⚠️  Failed requests: {}", report.errors.len());
    if report.dropped_errors > 0 {
        println!("   🗑️  Dropped errors: {}", report.dropped_errors);
    }
    println!("   📋 Total pages: {}", report.pages.len());
}
