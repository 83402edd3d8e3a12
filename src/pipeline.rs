// src/pipeline.rs
// =============================================================================
// One pass of a request through the engine.
//
// Steps, strictly in order:
// 1. Build the transport request (URL, method, form, headers, referer)
// 2. Run middlewares; the first error vetoes the call
// 3. Fill unset header slots from the default headers
// 4. Pick the client: shared, or a private one bound to a context proxy
// 5. Send the request
// 6. Parse the payload into a Document unless the request is raw
// 7. Run the resolved handlers one by one; the first error stops the chain
// 8. Close the response
//
// Steps 5 to 7 race against the job's cancellation token and deadline.
// Losing the race drops the in-flight future, which tears down the
// connection. The response is closed on every path once it exists.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use reqwest::header::HeaderMap;
use tracing::debug;

use crate::context::JobContext;
use crate::error::CrawlError;
use crate::registry::Registry;
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

pub struct Pipeline {
    transport: Transport,
    registry: Arc<Registry>,
    headers: HeaderMap,
}

impl Pipeline {
    pub fn new(transport: Transport, registry: Arc<Registry>, headers: HeaderMap) -> Self {
        Self {
            transport,
            registry,
            headers,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Runs the request. The returned response is already closed; status,
    /// final URL and headers remain readable.
    pub async fn execute(&self, ctx: &JobContext, request: Arc<Request>) -> Result<Arc<Response>, CrawlError> {
        if ctx.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        if ctx.is_expired() {
            return Err(CrawlError::DeadlineExceeded);
        }

        let mut outgoing = request.to_http()?;
        for middleware in self.registry.middlewares() {
            middleware(ctx, &request, &mut outgoing).map_err(CrawlError::Middleware)?;
        }
        for (name, value) in &self.headers {
            if !outgoing.headers().contains_key(name) {
                outgoing.headers_mut().insert(name.clone(), value.clone());
            }
        }
        let client = self.transport.select(ctx.proxies())?;

        debug!(request = %request, url = %outgoing.url(), "sending request");
        let received = guard(ctx, client.execute(outgoing)).await??;
        let response = Arc::new(Response::new(Arc::clone(&request), received));
        debug!(url = %response.url(), status = %response.status(), "response received");

        let result = guard(ctx, self.handle(ctx, &request, &response))
            .await
            .and_then(|handled| handled);
        response.close().await;
        result.map(|()| response)
    }

    async fn handle(&self, ctx: &JobContext, request: &Request, response: &Arc<Response>) -> Result<(), CrawlError> {
        if !request.raw {
            response.parse_document().await?;
        }
        for (key, handler) in self.registry.resolve(&request.callbacks)? {
            debug!(callback = %key, url = %response.url(), "running handler");
            handler(ctx.clone(), Arc::clone(response))
                .await
                .map_err(|source| CrawlError::Handler { key, source })?;
        }
        Ok(())
    }
}

// Runs `work` unless the context is cancelled or its deadline passes first.
async fn guard<F: Future>(ctx: &JobContext, work: F) -> Result<F::Output, CrawlError> {
    let bounded = async {
        match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .map_err(|_| CrawlError::DeadlineExceeded),
            None => Ok(work.await),
        }
    };
    tokio::select! {
        biased;
        _ = ctx.cancellation_token().cancelled() => Err(CrawlError::Cancelled),
        output = bounded => output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportOptions;
    use crate::config::DispatchMode;
    use crate::error::BoxError;
    use crate::registry::{handler, middleware};
    use parking_lot::Mutex;
    use reqwest::header::{HeaderName, HeaderValue};
    use std::time::Duration;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(registry: Registry, headers: HeaderMap) -> Pipeline {
        let transport = Transport::new(TransportOptions::default(), Duration::from_secs(5)).unwrap();
        Pipeline::new(transport, Arc::new(registry), headers)
    }

    async fn html_server(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_parses_and_dispatches() {
        let server = html_server("<html><head><title> Home </title></head></html>").await;
        let titles = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::default();
        {
            let titles = Arc::clone(&titles);
            registry
                .register(
                    "page",
                    handler(move |_ctx, response: Arc<Response>| {
                        let titles = Arc::clone(&titles);
                        async move {
                            let document = response.document().ok_or("document missing")?;
                            titles.lock().push(document.text("title")?);
                            Ok::<(), BoxError>(())
                        }
                    }),
                )
                .unwrap();
        }

        let request = Arc::new(Request::new(server.uri()).with_callback("page"));
        let response = pipeline(registry, HeaderMap::new())
            .execute(&JobContext::new(), request)
            .await
            .unwrap();

        assert_eq!(*titles.lock(), vec!["Home".to_string()]);
        assert_eq!(response.status(), 200);
        assert!(response.is_closed().await);
        assert!(response.document().is_none());
        assert!(matches!(response.body().await, Err(CrawlError::ResponseClosed)));
    }

    #[tokio::test]
    async fn test_handler_error_stops_chain() {
        let server = html_server("<p>hi</p>").await;
        let ran = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::default();
        for (name, fail) in [("a", false), ("a", true), ("a", false)] {
            let ran = Arc::clone(&ran);
            registry
                .register(
                    name,
                    handler(move |_ctx, _response| {
                        let ran = Arc::clone(&ran);
                        async move {
                            ran.lock().push(fail);
                            if fail {
                                return Err::<(), BoxError>("boom".into());
                            }
                            Ok(())
                        }
                    }),
                )
                .unwrap();
        }

        let err = pipeline(registry, HeaderMap::new())
            .execute(&JobContext::new(), Arc::new(Request::new(server.uri()).with_callback("a")))
            .await
            .unwrap_err();
        assert!(matches!(&err, CrawlError::Handler { key, .. } if key == "a"));
        assert_eq!(*ran.lock(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_middleware_veto_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let registry = Registry::default();
        registry.add_middleware(middleware(|_, _, _| Err("blocked".into())));
        let err = pipeline(registry, HeaderMap::new())
            .execute(&JobContext::new(), Arc::new(Request::new(server.uri()).with_raw(true)))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Middleware(_)));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_default_headers_fill_unset_slots() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "engine-test"))
            .and(header("accept", "text/plain"))
            .and(header("x-from-middleware", "1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut defaults = HeaderMap::new();
        defaults.insert("user-agent", HeaderValue::from_static("engine-test"));
        defaults.insert("accept", HeaderValue::from_static("text/html"));
        defaults.insert("x-from-middleware", HeaderValue::from_static("default"));

        let registry = Registry::default();
        registry.add_middleware(middleware(|_, _, outgoing: &mut reqwest::Request| {
            outgoing.headers_mut().insert(
                HeaderName::from_static("x-from-middleware"),
                HeaderValue::from_static("1"),
            );
            Ok(())
        }));

        let request = Request::new(server.uri())
            .with_header("Accept", "text/plain")
            .with_raw(true);
        pipeline(registry, defaults)
            .execute(&JobContext::new(), Arc::new(request))
            .await
            .unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_form_is_posted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("q=rust+lang&page=2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let pipeline = pipeline(Registry::default(), HeaderMap::new());
        let url = format!("{}/search", server.uri());
        let post = Request::new(&url)
            .with_form_value("q", "rust lang")
            .with_form_value("page", "2")
            .with_raw(true);
        pipeline.execute(&JobContext::new(), Arc::new(post)).await.unwrap();

        let get = Request::new(&url).with_method("GET").with_form_value("q", "rust").with_raw(true);
        pipeline.execute(&JobContext::new(), Arc::new(get)).await.unwrap();
        server.verify().await;
    }

    #[tokio::test]
    async fn test_raw_skips_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xfe, 0x00]))
            .mount(&server)
            .await;
        let pipeline = pipeline(Registry::default(), HeaderMap::new());

        let raw = Request::new(server.uri()).with_raw(true);
        pipeline.execute(&JobContext::new(), Arc::new(raw)).await.unwrap();

        // Not valid UTF-8, so parsing fails when it is attempted.
        let parsed = Request::new(server.uri());
        let err = pipeline
            .execute(&JobContext::new(), Arc::new(parsed))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Parse(_)));
    }

    #[tokio::test]
    async fn test_strict_dispatch_fails_unknown_callback() {
        let server = html_server("<p></p>").await;
        let pipeline = pipeline(Registry::new(DispatchMode::Strict), HeaderMap::new());
        let err = pipeline
            .execute(&JobContext::new(), Arc::new(Request::new(server.uri()).with_callback("nobody")))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::UnhandledCallback(_)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_slow_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let pipeline = pipeline(Registry::default(), HeaderMap::new());

        let ctx = JobContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.execute(&ctx, Arc::new(Request::new(server.uri()).with_raw(true))),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, CrawlError::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_aborts_slow_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let pipeline = pipeline(Registry::default(), HeaderMap::new());

        let ctx = JobContext::new().with_timeout(Duration::from_millis(100));
        let err = pipeline
            .execute(&ctx, Arc::new(Request::new(server.uri()).with_raw(true)))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_sending() {
        let pipeline = pipeline(Registry::default(), HeaderMap::new());
        let err = pipeline
            .execute(&JobContext::new(), Arc::new(Request::new("not a url")))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidUrl { .. }));
    }
}
