//! The per-request response envelope.

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, DATE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde_json::{Map, Value};

use super::transport::{ResponseHead, Transport};
use super::{EnvelopeError, EnvelopeState, Fragment, DIAGNOSTIC_KEY};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Buffered JSON output for one request.
///
/// Owns the header-write-once and finish-once invariants. Never shared
/// between requests.
pub struct ResponseEnvelope {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    defaults: HeaderMap,
    buffer: Map<String, Value>,
    headers_written: bool,
    finished: bool,
    head_request: bool,
    transport: Box<dyn Transport>,
}

impl ResponseEnvelope {
    /// Create an open envelope. `defaults` are added to every header block
    /// after Content-Type and Date.
    pub fn new(method: &Method, transport: Box<dyn Transport>, defaults: HeaderMap) -> Self {
        let mut envelope = Self {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::new(),
            defaults,
            buffer: Map::new(),
            headers_written: false,
            finished: false,
            head_request: *method == Method::HEAD,
            transport,
        };
        envelope.reset();
        envelope
    }

    pub fn state(&self) -> EnvelopeState {
        if self.finished {
            EnvelopeState::Finished
        } else if self.headers_written {
            EnvelopeState::HeadersWritten
        } else {
            EnvelopeState::Open
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn headers_written(&self) -> bool {
        self.headers_written
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase for the status line.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("Unknown")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The pending, not yet flushed payload.
    pub fn buffer(&self) -> &Map<String, Value> {
        &self.buffer
    }

    pub fn set_status(&mut self, status: StatusCode, reason: Option<String>) -> Result<(), EnvelopeError> {
        self.ensure_head_pending("set_status() after headers were written")?;
        self.status = status;
        self.reason = reason;
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), EnvelopeError> {
        self.ensure_head_pending("set_header() after headers were written")?;
        let name = HeaderName::try_from(name).map_err(|e| EnvelopeError::InvalidHeader(e.to_string()))?;
        let value = HeaderValue::try_from(value).map_err(|e| EnvelopeError::InvalidHeader(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Reset status, headers and buffer to their initial values.
    pub fn clear(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_head_pending("clear() after headers were written")?;
        self.reset();
        Ok(())
    }

    fn reset(&mut self) {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        if let Ok(date) = HeaderValue::from_str(&http_date()) {
            headers.insert(DATE, date);
        }
        for (name, value) in &self.defaults {
            headers.insert(name.clone(), value.clone());
        }
        self.headers = headers;
        self.buffer.clear();
        self.status = StatusCode::OK;
        self.reason = None;
    }

    /// Add a fragment to the pending buffer.
    pub fn write(&mut self, fragment: impl Into<Fragment>) -> Result<(), EnvelopeError> {
        self.ensure_open("write() after finish()")?;
        match fragment.into() {
            Fragment::Fields(fields) => {
                for (key, value) in fields {
                    self.buffer.insert(key, value);
                }
            }
            Fragment::Text(text) => match self.buffer.get_mut(DIAGNOSTIC_KEY) {
                Some(Value::String(existing)) => existing.push_str(&text),
                _ => {
                    self.buffer.insert(DIAGNOSTIC_KEY.to_owned(), Value::String(text));
                }
            },
        }
        Ok(())
    }

    /// Set a successful envelope. `token` is added when given.
    pub fn success(
        &mut self,
        code: i64,
        message: impl Into<String>,
        data: Value,
        token: Option<String>,
    ) -> Result<(), EnvelopeError> {
        self.ensure_open("success() after finish()")?;
        if let Some(token) = token {
            self.buffer.insert("token".to_owned(), Value::String(token));
        }
        self.set_outcome(code, message.into(), data);
        Ok(())
    }

    pub fn failure(&mut self, code: i64, message: impl Into<String>, data: Value) -> Result<(), EnvelopeError> {
        self.ensure_open("failure() after finish()")?;
        self.set_outcome(code, message.into(), data);
        Ok(())
    }

    fn set_outcome(&mut self, code: i64, message: String, data: Value) {
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        self.buffer.insert("code".to_owned(), Value::from(code));
        self.buffer.insert("message".to_owned(), Value::String(message));
        self.buffer.insert("data".to_owned(), data);
    }

    /// Send the pending buffer: with the head the first time, as a
    /// continuation chunk afterwards.
    pub fn flush(&mut self) -> Result<(), EnvelopeError> {
        self.ensure_open("flush() after finish()")?;
        let chunk = self.next_chunk(false)?;
        self.emit(chunk)
    }

    /// Complete the response. Fails if called twice.
    ///
    /// On [`EnvelopeError::ConnectionClosed`] the envelope is discarded
    /// unfinished and completion work must be skipped.
    pub fn finish(&mut self, fragment: Option<Fragment>) -> Result<(), EnvelopeError> {
        self.ensure_open("finish() called twice")?;
        if let Some(fragment) = fragment {
            self.write(fragment)?;
        }

        let chunk = self.next_chunk(true)?;
        self.emit(chunk)?;
        self.transport.end();
        self.finished = true;
        Ok(())
    }

    /// The bytes the next write carries, if any.
    ///
    /// 204 and 304 never carry a body: a pending buffer is refused and the
    /// head goes out without entity headers. A finishing head write sets
    /// Content-Length from the final buffer.
    fn next_chunk(&mut self, finishing: bool) -> Result<Option<Bytes>, EnvelopeError> {
        if matches!(self.status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED) {
            if !self.buffer.is_empty() {
                return Err(EnvelopeError::IllegalState("cannot send a body with 204 or 304"));
            }
            if !self.headers_written {
                for name in [CONTENT_TYPE, CONTENT_LENGTH] {
                    self.headers.remove(name);
                }
            }
            return Ok(None);
        }

        if self.headers_written {
            // Nothing left to say after an explicit flush.
            if finishing && self.buffer.is_empty() {
                return Ok(None);
            }
            return self.take_chunk().map(Some);
        }

        let chunk = self.take_chunk()?;
        if finishing {
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(chunk.len()));
        }
        Ok(Some(chunk))
    }

    fn take_chunk(&mut self) -> Result<Bytes, EnvelopeError> {
        let buffer = std::mem::take(&mut self.buffer);
        Ok(Bytes::from(serde_json::to_vec(&buffer)?))
    }

    fn emit(&mut self, chunk: Option<Bytes>) -> Result<(), EnvelopeError> {
        if self.transport.is_closed() {
            return Err(EnvelopeError::ConnectionClosed);
        }

        if !self.headers_written {
            let head = ResponseHead {
                status: self.status,
                reason: self.reason().to_owned(),
                headers: self.headers.clone(),
            };
            let body = if self.head_request { None } else { chunk };
            self.transport.write_head(head, body)?;
            self.headers_written = true;
        } else if let Some(chunk) = chunk {
            if !self.head_request {
                self.transport.write_chunk(chunk)?;
            }
        }
        Ok(())
    }

    fn ensure_open(&self, what: &'static str) -> Result<(), EnvelopeError> {
        if self.finished {
            return Err(EnvelopeError::IllegalState(what));
        }
        Ok(())
    }

    fn ensure_head_pending(&self, what: &'static str) -> Result<(), EnvelopeError> {
        if self.headers_written {
            return Err(EnvelopeError::IllegalState(what));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResponseEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseEnvelope")
            .field("status", &self.status)
            .field("state", &self.state())
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
