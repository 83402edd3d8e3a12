// src/document.rs
// =============================================================================
// Queryable view of a parsed HTML payload.
//
// We use the `scraper` crate which:
// - Parses HTML into a DOM (Document Object Model)
// - Supports CSS selectors for finding elements
// - Is built on html5ever (Mozilla's HTML parser)
//
// A Document keeps the decoded source and the page URL. scraper's `Html` is
// not thread-safe, so it is built on demand inside each query and never held
// across an await point.
// =============================================================================

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::DocumentError;
use crate::form::Form;

#[derive(Debug, Clone)]
pub struct Document {
    url: Url,
    source: String,
}

impl Document {
    pub fn new(url: Url, source: String) -> Self {
        Self { url, source }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parses the source into a scraper document for arbitrary queries.
    pub fn html(&self) -> Html {
        Html::parse_document(&self.source)
    }

    /// Text of every node matching `selector`, whitespace collapsed to single spaces.
    pub fn text(&self, selector: &str) -> Result<String, DocumentError> {
        let selector = parse_selector(selector)?;
        let html = self.html();
        let text = html
            .select(&selector)
            .map(|node| node.text().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    /// Trimmed attribute value of the first node matching `selector`.
    pub fn attr(&self, selector: &str, attr: &str) -> Result<Option<String>, DocumentError> {
        let selector = parse_selector(selector)?;
        let html = self.html();
        let value = html
            .select(&selector)
            .next()
            .and_then(|node| node.value().attr(attr))
            .map(|v| v.trim().to_string());
        Ok(value)
    }

    /// Returns the first selector in `selectors` that matches anything.
    pub fn find_any<'a>(&self, selectors: &[&'a str]) -> Result<Option<&'a str>, DocumentError> {
        let html = self.html();
        for &raw in selectors {
            let selector = parse_selector(raw)?;
            if html.select(&selector).next().is_some() {
                return Ok(Some(raw));
            }
        }
        Ok(None)
    }

    /// Text of each node matching `selector`, one entry per node, whitespace collapsed.
    pub fn texts(&self, selector: &str) -> Result<Vec<String>, DocumentError> {
        let selector = parse_selector(selector)?;
        let html = self.html();
        Ok(html
            .select(&selector)
            .map(|node| node.text().collect::<Vec<_>>().join(" "))
            .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect())
    }

    /// `attr` of every node matching `selector` that has it.
    pub fn attrs(&self, selector: &str, attr: &str) -> Result<Vec<String>, DocumentError> {
        let selector = parse_selector(selector)?;
        let html = self.html();
        Ok(html
            .select(&selector)
            .filter_map(|node| node.value().attr(attr))
            .map(|v| v.trim().to_string())
            .collect())
    }

    /// Reads the first form matching `selector` with its default values.
    pub fn form(&self, selector: &str) -> Result<Option<Form>, DocumentError> {
        let selector = parse_selector(selector)?;
        let html = self.html();
        let Some(node) = html.select(&selector).next() else {
            return Ok(None);
        };
        Form::parse(&self.url, node).map(Some)
    }

    /// Absolute http(s) URLs from the `href` of every node matching `selector`.
    pub fn links(&self, selector: &str) -> Result<Vec<Url>, DocumentError> {
        let selector = parse_selector(selector)?;
        let html = self.html();
        Ok(html
            .select(&selector)
            .filter_map(|node| href(&node))
            .filter_map(|href| resolve_link(&self.url, href))
            .collect())
    }
}

fn href<'a>(node: &ElementRef<'a>) -> Option<&'a str> {
    node.value().attr("href")
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, DocumentError> {
    Selector::parse(selector).map_err(|e| DocumentError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

// Resolves a possibly-relative link to an absolute URL
//
// We skip:
// - fragment-only anchors (#section)
// - anything that is not http/https after resolution (mailto:, tel:, javascript:, ...)
fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let url = base.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}
