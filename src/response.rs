// src/response.rs
// =============================================================================
// The wrapped result of a transport call.
//
// A Response owns the body of the underlying reqwest response. The body is
// read at most once, on first access, and kept in memory until `close()`.
// The pipeline always closes the response before it returns; a handler that
// keeps an `Arc<Response>` afterwards still sees status, URL and headers but
// gets `CrawlError::ResponseClosed` from the body accessors.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::document::Document;
use crate::error::CrawlError;
use crate::request::Request;

enum Body {
    Unread(reqwest::Response),
    Buffered(Arc<[u8]>),
    Closed,
}

pub struct Response {
    request: Arc<Request>,
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Mutex<Body>,
    document: RwLock<Option<Arc<Document>>>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("request", &self.request)
            .finish()
    }
}

impl Response {
    pub fn new(request: Arc<Request>, response: reqwest::Response) -> Self {
        Self {
            request,
            url: response.url().clone(),
            status: response.status(),
            headers: response.headers().clone(),
            body: Mutex::new(Body::Unread(response)),
            document: RwLock::new(None),
        }
    }

    /// The request that produced this response.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Final URL, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Reads the body on first call and returns the buffered copy afterwards.
    pub async fn body(&self) -> Result<Arc<[u8]>, CrawlError> {
        let mut body = self.body.lock().await;
        match std::mem::replace(&mut *body, Body::Closed) {
            Body::Unread(response) => {
                // A failed read leaves the body closed; the connection is gone either way.
                let bytes = response.bytes().await.map_err(CrawlError::Body)?;
                let buffered: Arc<[u8]> = Arc::from(&bytes[..]);
                *body = Body::Buffered(Arc::clone(&buffered));
                Ok(buffered)
            }
            Body::Buffered(bytes) => {
                *body = Body::Buffered(Arc::clone(&bytes));
                Ok(bytes)
            }
            Body::Closed => Err(CrawlError::ResponseClosed),
        }
    }

    /// Body decoded as UTF-8.
    pub async fn text(&self) -> Result<String, CrawlError> {
        let bytes = self.body().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| CrawlError::Parse(e.to_string()))
    }

    /// The parsed document, if the payload was parsed and the response is still open.
    pub fn document(&self) -> Option<Arc<Document>> {
        self.document.read().clone()
    }

    /// Reads and parses the payload as HTML. Repeated calls reuse the first result.
    pub async fn parse_document(&self) -> Result<Arc<Document>, CrawlError> {
        if let Some(document) = self.document() {
            return Ok(document);
        }
        let source = self.text().await?;
        let document = Arc::new(Document::new(self.url.clone(), source));
        *self.document.write() = Some(Arc::clone(&document));
        Ok(document)
    }

    /// Writes the body to `path`.
    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let bytes = self
            .body()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        tokio::fs::write(path, &bytes[..]).await
    }

    /// Releases the body buffer and the parsed document. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.body.lock().await, Body::Closed);
        if let Body::Unread(_) = previous {
            debug!(url = %self.url, "discarding unread response body");
        }
        drop(previous);
        self.document.write().take();
    }

    pub async fn is_closed(&self) -> bool {
        matches!(*self.body.lock().await, Body::Closed)
    }
}
