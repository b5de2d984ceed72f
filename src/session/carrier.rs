//! Request-side locations a session id may travel in.

use std::collections::HashMap;

use axum::http::{HeaderMap, Method};
use axum_extra::extract::cookie::CookieJar;
use serde_json::{Map, Value};

/// Everything about an inbound request that can carry a session id.
#[derive(Debug, Clone)]
pub struct Carrier {
    method: Method,
    cookies: CookieJar,
    query: HashMap<String, String>,
    body: Option<Map<String, Value>>,
}

impl Carrier {
    /// Build a carrier from request headers, the raw query string and the
    /// decoded JSON body (if any).
    pub fn new(
        method: Method,
        headers: &HeaderMap,
        query: Option<&str>,
        body: Option<Map<String, Value>>,
    ) -> Self {
        let mut params = HashMap::new();
        if let Some(query) = query {
            // First occurrence wins.
            for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
                params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
            }
        }

        Self {
            method,
            cookies: CookieJar::from_headers(headers),
            query: params,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|c| c.value())
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn body(&self) -> Option<&Map<String, Value>> {
        self.body.as_ref()
    }

    pub fn body_field(&self, name: &str) -> Option<&str> {
        self.body.as_ref()?.get(name)?.as_str()
    }

    /// Methods whose session id may travel in the query string.
    pub fn is_read_only(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Methods whose session id may travel in the JSON body.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::DELETE | Method::PATCH
        )
    }

    /// Find a session id under `field`: cookie, then query (read-only
    /// methods) or body (mutating methods). Empty values count as absent.
    pub fn session_id(&self, field: &str) -> Option<String> {
        let candidate = self
            .cookie(field)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                if self.is_read_only() {
                    self.query(field)
                } else if self.is_mutating() {
                    self.body_field(field)
                } else {
                    None
                }
            })?;

        if candidate.is_empty() {
            None
        } else {
            Some(candidate.to_owned())
        }
    }
}
