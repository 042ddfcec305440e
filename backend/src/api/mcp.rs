//! MCP Streamable HTTP endpoint of the dev server.
//!
//! Converts between axum and [`HttpMessage`] so every method on `/mcp` goes
//! through [`HttpServerRunner::handle_request`] exactly as a CGI request would.

use axum::{
    body::{to_bytes, Body as AxumBody},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::http::{Body, HttpMessage};
use crate::runner::HttpServerRunner;

/// Largest request body the endpoint reads.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Validate Origin header for DNS rebinding protection.
fn validate_origin(headers: &HeaderMap) -> bool {
    // Non-browser clients send no Origin
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let allowed = ["http://localhost", "https://localhost", "http://127.0.0.1", "https://127.0.0.1"]
        .iter()
        .any(|prefix| origin.starts_with(prefix));
    if !allowed {
        warn!("Rejecting MCP request from origin: {}", origin);
    }
    allowed
}

/// Any method on `/mcp`.
pub async fn mcp_endpoint(
    State(runner): State<Arc<HttpServerRunner>>,
    request: Request,
) -> Response {
    if !validate_origin(request.headers()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid origin"})),
        )
            .into_response();
    }

    let message = match into_message(request).await {
        Ok(message) => message,
        Err(response) => return response,
    };

    match runner.handle_request(Some(message)).await {
        Ok(response) => into_response(response),
        Err(e) => {
            error!("MCP request failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Internal server error"})),
            )
                .into_response()
        }
    }
}

async fn into_message(request: Request) -> Result<HttpMessage, Response> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        warn!("Failed to read MCP request body: {}", e);
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({"error": "Request body too large"})),
        )
            .into_response()
    })?;

    let mut message = HttpMessage::request(parts.method, parts.uri.path());
    message.query = parts.uri.query().map(str::to_string);
    message.headers = parts.headers;
    if !bytes.is_empty() {
        let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Request body is not UTF-8"})),
            )
                .into_response()
        })?;
        message.body = Body::Full(text);
    }
    debug!("MCP {} {}", message.method, message.path);
    Ok(message)
}

fn into_response(message: HttpMessage) -> Response {
    let body = match message.body {
        Body::Empty => AxumBody::empty(),
        Body::Full(text) => AxumBody::from(text),
        Body::Stream(rx) => {
            AxumBody::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
    };
    let mut response = Response::new(body);
    *response.status_mut() = message.status;
    *response.headers_mut() = message.headers;
    response
}

/// Unknown paths.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Not found"})),
    )
        .into_response()
}
