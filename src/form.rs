// src/form.rs
// =============================================================================
// Filling in HTML forms found on a page.
//
// Document::form(selector) reads the first matching <form> once:
// - action and method attributes
// - default values: every named <input> except submit/reset, radio and
//   checkbox inputs only when checked, <textarea> contents, and for each
//   <select> the value of its first selected option (empty if none)
// - the options of every <select>, so a value can later be picked by the
//   option's visible text
//
// The result owns plain strings only and can be filled in and turned into a
// Request from any task.
// =============================================================================

use scraper::ElementRef;
use url::Url;

use crate::document::parse_selector;
use crate::error::DocumentError;
use crate::request::Request;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectField {
    name: String,
    /// (trimmed option text, option value)
    options: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    page: Url,
    action: Option<String>,
    method: Option<String>,
    values: Vec<(String, String)>,
    selects: Vec<SelectField>,
}

impl Form {
    pub(crate) fn parse(page: &Url, form: ElementRef<'_>) -> Result<Self, DocumentError> {
        let mut parsed = Self {
            page: page.clone(),
            action: non_empty(form.value().attr("action")),
            method: non_empty(form.value().attr("method")).map(|m| m.to_ascii_uppercase()),
            values: Vec::new(),
            selects: Vec::new(),
        };

        for input in form.select(&parse_selector("input")?) {
            let element = input.value();
            let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
            match kind.as_str() {
                "submit" | "reset" => continue,
                "radio" | "checkbox" if element.attr("checked").is_none() => continue,
                _ => {}
            }
            let name = element.attr("name").unwrap_or_default();
            parsed.set(name, element.attr("value").unwrap_or_default());
        }

        for textarea in form.select(&parse_selector("textarea")?) {
            let name = textarea.value().attr("name").unwrap_or_default();
            parsed.set(name, textarea.text().collect::<String>());
        }

        let option_selector = parse_selector("option")?;
        for select in form.select(&parse_selector("select")?) {
            let Some(name) = non_empty(select.value().attr("name")) else {
                continue;
            };
            let mut options = Vec::new();
            let mut chosen = None;
            for option in select.select(&option_selector) {
                let value = option.value().attr("value").unwrap_or_default().to_string();
                if chosen.is_none() && option.value().attr("selected").is_some() {
                    chosen = Some(value.clone());
                }
                options.push((option.text().collect::<String>().trim().to_string(), value));
            }
            parsed.set(name.as_str(), chosen.unwrap_or_default());
            parsed.selects.push(SelectField { name, options });
        }

        Ok(parsed)
    }

    /// Raw `action` attribute, if the form has one.
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn values(&self) -> &[(String, String)] {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// True when the form carries `name`, even with an empty value.
    pub fn has_value(&self, name: &str) -> bool {
        self.value(name).is_some()
    }

    /// Sets or replaces a value. Empty names are ignored and return false.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if name.is_empty() {
            return false;
        }
        let value = value.into();
        match self.values.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
        true
    }

    /// Sets every pair; false if any of them was rejected.
    pub fn set_all<I, K, V>(&mut self, values: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        values
            .into_iter()
            .fold(true, |ok, (name, value)| self.set(name, value) && ok)
    }

    /// Picks the option of select `name` whose trimmed text is `text`.
    pub fn select(&mut self, name: &str, text: &str) -> bool {
        let value = self
            .selects
            .iter()
            .filter(|field| field.name == name)
            .flat_map(|field| field.options.iter())
            .find(|(option, _)| option == text)
            .map(|(_, value)| value.clone());
        match value {
            Some(value) => self.set(name, value),
            None => false,
        }
    }

    /// Builds the submission. The action resolves against the page URL; a
    /// form without one submits to the page itself.
    pub fn into_request(self) -> Request {
        let target = self.action.unwrap_or_else(|| self.page.to_string());
        let mut request = Request::new(target).with_referer(self.page.as_str());
        if let Some(method) = self.method {
            request = request.with_method(method);
        }
        request.form = self.values;
        request
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}
