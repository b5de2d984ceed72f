//! Client for the session gateway's envelope API.

use reqwest::header::COOKIE;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Envelope code for a request that carried no session id.
pub const MISSING_SESSION_ID: i64 = 11000;

/// Envelope code for an unknown or expired session id.
pub const INVALID_SESSION_ID: i64 = 12000;

/// Body of every gateway response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Envelope {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// A response as seen by the client.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub envelope: Envelope,
}

#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned status {status} without an envelope: {body}")]
    NotAnEnvelope { status: StatusCode, body: String },
}

pub struct GatewayClient {
    client: Client,
    base_url: String,
    token_name: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token_name: "token".to_string(),
            token: None,
        }
    }

    /// Use a different session id field name than `token`.
    pub fn with_token_name(mut self, name: &str) -> Self {
        self.token_name = name.to_string();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Sign in and remember the issued session token.
    pub async fn login(&mut self, username: &str) -> Result<Reply, SdkError> {
        let reply = self
            .send(Method::POST, "/api/session", Some(json!({ "username": username })))
            .await?;
        if let Some(token) = &reply.envelope.token {
            self.token = Some(token.clone());
        }
        Ok(reply)
    }

    /// Destroy the session and forget the token.
    pub async fn logout(&mut self) -> Result<Reply, SdkError> {
        let reply = self.send(Method::DELETE, "/api/session", None).await?;
        if reply.envelope.is_success() {
            self.token = None;
        }
        Ok(reply)
    }

    pub async fn get(&self, path: &str) -> Result<Reply, SdkError> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Reply, SdkError> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Reply, SdkError> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Reply, SdkError> {
        self.send(Method::DELETE, path, None).await
    }

    /// Send a request carrying the session token as a cookie.
    pub async fn send(&self, method: Method, path: &str, body: Option<Value>) -> Result<Reply, SdkError> {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        match serde_json::from_str::<Envelope>(&text) {
            Ok(envelope) => Ok(Reply { status, envelope }),
            Err(_) => Err(SdkError::NotAnEnvelope { status, body: text }),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.header(COOKIE, format!("{}={}", self.token_name, token)),
            None => request,
        }
    }
}
