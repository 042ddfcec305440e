//! HTTP messages exchanged between the embedding environment and the runner.
//!
//! [`HttpMessage`] is deliberately independent of any server framework so the
//! same runner can answer a CGI invocation, an axum request or a test.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Body of an [`HttpMessage`].
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Complete body
    Full(String),
    /// Server-Sent Events, one pre-formatted event per chunk
    Stream(mpsc::Receiver<String>),
}

/// An HTTP request or response.
#[derive(Debug)]
pub struct HttpMessage {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl HttpMessage {
    /// Create a request.
    pub fn request(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// Create a response.
    pub fn response(status: StatusCode) -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            query: None,
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// Create a response with a JSON body.
    pub fn json(status: StatusCode, value: &impl Serialize) -> Self {
        let body = serde_json::to_string(value).unwrap_or_default();
        Self::response(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Add a header, skipping names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!("Skipping invalid header: {}", name),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Header value as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Complete body as text, if the body is not a stream.
    pub fn body_text(&self) -> Option<&str> {
        match &self.body {
            Body::Full(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Whether the `Accept` header lists `text/event-stream`.
    pub fn accepts_event_stream(&self) -> bool {
        self.header("accept")
            .is_some_and(|accept| accept.contains("text/event-stream"))
    }
}

/// Source of the current inbound request when the caller does not pass one.
#[async_trait]
pub trait RequestContext: Send + Sync {
    async fn capture(&self) -> std::io::Result<HttpMessage>;
}

/// Reads the request of a CGI invocation from the process environment and stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct CgiContext;

impl CgiContext {
    /// Build a request from CGI meta-variables and an already read body.
    pub fn from_vars(
        vars: impl IntoIterator<Item = (String, String)>,
        body: Option<String>,
    ) -> HttpMessage {
        let mut request = HttpMessage::request(Method::GET, "/");

        for (key, value) in vars {
            match key.as_str() {
                "REQUEST_METHOD" => {
                    if let Ok(method) = Method::from_bytes(value.as_bytes()) {
                        request.method = method;
                    }
                }
                "PATH_INFO" if !value.is_empty() => request.path = value,
                "QUERY_STRING" if !value.is_empty() => request.query = Some(value),
                "CONTENT_TYPE" => request.set_header("content-type", &value),
                "CONTENT_LENGTH" => request.set_header("content-length", &value),
                _ => {
                    if let Some(name) = key.strip_prefix("HTTP_") {
                        let name = name.to_ascii_lowercase().replace('_', "-");
                        request.set_header(&name, &value);
                    }
                }
            }
        }

        if let Some(body) = body {
            request.body = Body::Full(body);
        }
        request
    }
}

#[async_trait]
impl RequestContext for CgiContext {
    async fn capture(&self) -> std::io::Result<HttpMessage> {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        let length = vars
            .iter()
            .find(|(k, _)| k == "CONTENT_LENGTH")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        let body = if length > 0 {
            let mut buf = vec![0u8; length];
            tokio::io::stdin().read_exact(&mut buf).await?;
            let text = String::from_utf8(buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Some(text)
        } else {
            None
        };

        Ok(Self::from_vars(vars, body))
    }
}
