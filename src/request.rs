// src/request.rs
// =============================================================================
// The outbound work item.
//
// A Request is a plain value: target URL (absolute or relative to the
// referer), method, optional form data, extra headers, the raw flag and the
// callback names whose handlers run on success. It is serializable so the
// bus queue can ship it across processes.
//
// Turning a Request into a transport request:
// 1. Resolve the URL against the referer (if any)
// 2. Pick the method (GET by default, POST when a form is present)
// 3. Encode the form into the query (GET/HEAD) or the body (everything else)
// 4. Copy the extra headers and set Referer
// =============================================================================

use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, REFERER};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CrawlError;
use crate::response::Response;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Absolute URL, or a reference resolved against `referer`.
    pub url: String,

    /// HTTP method. When unset: GET, or POST if `form` is non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Form values, kept in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form: Vec<(String, String)>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,

    /// Skip payload parsing when true.
    #[serde(default)]
    pub raw: bool,

    /// Handlers registered under these names run on success, in order.
    #[serde(default)]
    pub callbacks: Vec<String>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Builds a request for a link found on `response`, resolved against its URL.
    pub fn follow(response: &Response, href: impl Into<String>) -> Self {
        Self::new(href).with_referer(response.url().as_str())
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_form_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_callback(mut self, name: impl Into<String>) -> Self {
        self.callbacks.push(name.into());
        self
    }

    pub fn with_callbacks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.callbacks.extend(names.into_iter().map(Into::into));
        self
    }

    /// The effective method name.
    pub fn method(&self) -> &str {
        match self.method.as_deref() {
            Some(method) if !method.is_empty() => method,
            _ if !self.form.is_empty() => "POST",
            _ => "GET",
        }
    }

    /// Parses the URL, resolving it against the referer when one is set.
    pub fn resolve_url(&self) -> Result<Url, CrawlError> {
        match self.referer.as_deref() {
            Some(referer) if !referer.is_empty() => {
                let base = parse_url(referer)?;
                base.join(&self.url).map_err(|source| CrawlError::InvalidUrl {
                    url: self.url.clone(),
                    source,
                })
            }
            _ => parse_url(&self.url),
        }
    }

    /// Builds the transport request. Default headers are merged later by the pipeline.
    pub fn to_http(&self) -> Result<reqwest::Request, CrawlError> {
        let mut url = self.resolve_url()?;
        let method = Method::from_bytes(self.method().to_ascii_uppercase().as_bytes())
            .map_err(|_| CrawlError::InvalidMethod(self.method().to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(header_name(name)?, header_value(name, value)?);
        }
        if let Some(referer) = self.referer.as_deref().filter(|r| !r.is_empty()) {
            if !headers.contains_key(REFERER) {
                headers.insert(REFERER, header_value("Referer", referer)?);
            }
        }

        let mut body = None;
        if !self.form.is_empty() {
            if method == Method::GET || method == Method::HEAD {
                url.query_pairs_mut()
                    .extend_pairs(self.form.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            } else {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(self.form.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .finish();
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                }
                body = Some(reqwest::Body::from(encoded));
            }
        }

        let mut request = reqwest::Request::new(method, url);
        *request.headers_mut() = headers;
        *request.body_mut() = body;
        Ok(request)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.url)
    }
}

fn parse_url(raw: &str) -> Result<Url, CrawlError> {
    Url::parse(raw).map_err(|source| CrawlError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

pub(crate) fn header_name(name: &str) -> Result<HeaderName, CrawlError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| CrawlError::InvalidHeader(name.to_string()))
}

pub(crate) fn header_value(name: &str, value: &str) -> Result<HeaderValue, CrawlError> {
    HeaderValue::from_str(value).map_err(|_| CrawlError::InvalidHeader(name.to_string()))
}
