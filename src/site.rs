// src/site.rs
// =============================================================================
// The spider behind the CLI.
//
// How it works:
// 1. main schedules the start URLs with depth 1 in the job metadata
// 2. "page" records status and <title> of every HTML response
// 3. "links" extracts same-domain links and schedules the ones not seen yet,
//    one level deeper, until max_depth is reached
// 4. "dump" records status and size of raw responses
//
// The engine itself never deduplicates; the visited set lives here.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use crawl_engine::{BoxError, Engine, JobContext, Queue, Request, Response};

const DEPTH_KEY: &str = "depth";

// One visited page, as printed in the report
#[derive(Debug, Clone, Serialize)]
pub struct PageRecord {
    pub url: String,
    pub status: u16,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
}

impl PageRecord {
    pub fn is_ok(&self) -> bool {
        self.status < 400
    }
}

pub struct Spider {
    scheduler: Arc<dyn Queue>,
    max_depth: usize,
    visited: Mutex<HashSet<String>>,
    pages: Mutex<Vec<PageRecord>>,
}

impl Spider {
    pub fn new(scheduler: Arc<dyn Queue>, max_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            max_depth: max_depth.max(1),
            visited: Mutex::new(HashSet::new()),
            pages: Mutex::new(Vec::new()),
        })
    }

    /// Registers the "page", "links" and "dump" handlers on `engine`.
    pub fn register(self: &Arc<Self>, engine: &Engine) -> Result<()> {
        let spider = Arc::clone(self);
        engine.register("page", move |ctx, response| {
            let spider = Arc::clone(&spider);
            async move { spider.record_page(&ctx, &response) }
        })?;

        let spider = Arc::clone(self);
        engine.register("links", move |ctx, response| {
            let spider = Arc::clone(&spider);
            async move { spider.follow_links(ctx, response).await }
        })?;

        let spider = Arc::clone(self);
        engine.register("dump", move |ctx, response| {
            let spider = Arc::clone(&spider);
            async move { spider.record_raw(&ctx, &response).await }
        })?;
        Ok(())
    }

    /// Marks a start URL as visited and returns its depth-1 context.
    pub fn seed(&self, url: &str, ctx: JobContext) -> JobContext {
        if let Ok(url) = Url::parse(url) {
            self.visited.lock().insert(normalize(url));
        }
        ctx.with_metadata(DEPTH_KEY, "1")
    }

    /// Visited pages in completion order.
    pub fn pages(&self) -> Vec<PageRecord> {
        self.pages.lock().clone()
    }

    fn record_page(&self, ctx: &JobContext, response: &Response) -> Result<(), BoxError> {
        let title = match response.document() {
            Some(document) => Some(document.text("title")?).filter(|t| !t.is_empty()),
            None => None,
        };
        self.pages.lock().push(PageRecord {
            url: response.url().to_string(),
            status: response.status().as_u16(),
            depth: depth(ctx),
            title,
            bytes: None,
        });
        Ok(())
    }

    async fn record_raw(&self, ctx: &JobContext, response: &Response) -> Result<(), BoxError> {
        let bytes = response.body().await?.len();
        self.pages.lock().push(PageRecord {
            url: response.url().to_string(),
            status: response.status().as_u16(),
            depth: depth(ctx),
            title: None,
            bytes: Some(bytes),
        });
        Ok(())
    }

    async fn follow_links(&self, ctx: JobContext, response: Arc<Response>) -> Result<(), BoxError> {
        let current = depth(&ctx);
        if current >= self.max_depth || !response.status().is_success() {
            return Ok(());
        }
        let Some(document) = response.document() else {
            return Ok(());
        };

        let fresh: Vec<Url> = {
            let mut visited = self.visited.lock();
            document
                .links("a[href]")?
                .into_iter()
                .filter(|link| same_site(link, response.url()))
                .map(normalize_url)
                .filter(|link| visited.insert(link.to_string()))
                .collect()
        };

        let callbacks = response.request().callbacks.clone();
        let raw = response.request().raw;
        let next = (current + 1).to_string();
        for link in fresh {
            let request = Request::follow(&response, link.as_str())
                .with_callbacks(callbacks.iter().cloned())
                .with_raw(raw);
            let child = ctx.child().with_metadata(DEPTH_KEY, next.as_str());
            self.scheduler.schedule(child, request).await?;
        }
        Ok(())
    }
}

fn depth(ctx: &JobContext) -> usize {
    ctx.metadata(DEPTH_KEY)
        .and_then(|d| d.parse().ok())
        .unwrap_or(1)
}

// Only crawl pages on the same host as the page that linked to them
fn same_site(link: &Url, page: &Url) -> bool {
    link.host_str().is_some() && link.host_str() == page.host_str()
}

// Fragments never change what the server returns
fn normalize_url(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

fn normalize(url: Url) -> String {
    normalize_url(url).to_string()
}
