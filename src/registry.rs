// src/registry.rs
// =============================================================================
// Handler and middleware registry.
//
// Handlers are registered under a callback name. A name containing '*' is a
// glob pattern ('*' = any run of characters, everything else literal);
// anything else, '?' included, is an exact key. For a request's callback list, resolve()
// returns, in order:
// 1. for each pattern (in registration order) that matches any callback,
//    all handlers registered under that pattern
// 2. for each callback (in list order), all handlers under that exact name
// Within a group, handlers keep registration order.
//
// Registration normally happens before the workers start. Dispatch takes
// recursive read locks, which do not queue behind a waiting writer.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::config::DispatchMode;
use crate::context::JobContext;
use crate::error::{BoxError, ConfigError, CrawlError};
use crate::request::Request;
use crate::response::Response;

/// Runs on a completed response. An error aborts the remaining handlers.
pub type Handler =
    Arc<dyn Fn(JobContext, Arc<Response>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Runs before the network call and may edit or veto the transport request.
pub type Middleware =
    Arc<dyn Fn(&JobContext, &Request, &mut reqwest::Request) -> Result<(), BoxError> + Send + Sync>;

/// Wraps an async closure as a `Handler`.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(JobContext, Arc<Response>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move |ctx, response| Box::pin(f(ctx, response)))
}

/// Wraps a closure as a `Middleware`.
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(&JobContext, &Request, &mut reqwest::Request) -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct PatternRoute {
    pattern: String,
    matcher: Regex,
    handlers: Vec<Handler>,
}

#[derive(Default)]
struct Routes {
    patterns: Vec<PatternRoute>,
    exact: HashMap<String, Vec<Handler>>,
    middlewares: Vec<Middleware>,
}

pub struct Registry {
    routes: RwLock<Routes>,
    mode: DispatchMode,
}

impl Registry {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            routes: RwLock::new(Routes::default()),
            mode,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn register(&self, name: impl Into<String>, handler: Handler) -> Result<(), ConfigError> {
        let name = name.into();
        let mut routes = self.routes.write();
        if !is_pattern(&name) {
            routes.exact.entry(name).or_default().push(handler);
            return Ok(());
        }
        if let Some(route) = routes.patterns.iter_mut().find(|r| r.pattern == name) {
            route.handlers.push(handler);
            return Ok(());
        }
        let matcher = glob_to_regex(&name)?;
        routes.patterns.push(PatternRoute {
            pattern: name,
            matcher,
            handlers: vec![handler],
        });
        Ok(())
    }

    pub fn add_middleware(&self, middleware: Middleware) {
        self.routes.write().middlewares.push(middleware);
    }

    /// Middlewares in registration order.
    pub fn middlewares(&self) -> Vec<Middleware> {
        self.routes.read_recursive().middlewares.clone()
    }

    /// Registered keys: patterns in registration order, then exact names sorted.
    pub fn names(&self) -> Vec<String> {
        let routes = self.routes.read_recursive();
        let mut exact: Vec<String> = routes.exact.keys().cloned().collect();
        exact.sort();
        routes
            .patterns
            .iter()
            .map(|r| r.pattern.clone())
            .chain(exact)
            .collect()
    }

    /// Handlers to run for `callbacks`, each paired with the key it was registered under.
    pub fn resolve(&self, callbacks: &[String]) -> Result<Vec<(String, Handler)>, CrawlError> {
        let routes = self.routes.read_recursive();
        let mut matched = vec![false; callbacks.len()];
        let mut resolved = Vec::new();

        for route in &routes.patterns {
            let mut hit = false;
            for (i, name) in callbacks.iter().enumerate() {
                if route.matcher.is_match(name) {
                    matched[i] = true;
                    hit = true;
                }
            }
            if hit {
                resolved.extend(route.handlers.iter().map(|h| (route.pattern.clone(), Arc::clone(h))));
            }
        }

        for (i, name) in callbacks.iter().enumerate() {
            if let Some(handlers) = routes.exact.get(name) {
                matched[i] = true;
                resolved.extend(handlers.iter().map(|h| (name.clone(), Arc::clone(h))));
            }
        }

        for (name, _) in callbacks.iter().zip(&matched).filter(|(_, hit)| !**hit) {
            match self.mode {
                DispatchMode::Strict => return Err(CrawlError::UnhandledCallback(name.clone())),
                DispatchMode::Permissive => warn!(callback = %name, "no handler registered; skipping"),
            }
        }
        Ok(resolved)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DispatchMode::default())
    }
}

fn is_pattern(name: &str) -> bool {
    name.contains('*')
}

fn glob_to_regex(pattern: &str) -> Result<Regex, ConfigError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?s)^");
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| ConfigError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
