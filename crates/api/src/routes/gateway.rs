//! Catch-all handler mapping HTTP onto the router.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use common::ClientId;
use router::{Method, Request};
use serde_json::Value;

use crate::AppState;
use crate::error::ApiError;

/// Header naming the rate-limited client.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Set to `true` when the body came from a fallback.
pub const DEGRADED_HEADER: &str = "x-degraded";

/// Any route not served by axum itself goes through the router.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let method =
        Method::parse(method.as_str()).ok_or_else(|| ApiError::MethodNotAllowed(method.to_string()))?;
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let bearer = bearer_token(&headers);
    let client = header_str(&headers, CLIENT_ID_HEADER)
        .map(ClientId::new)
        .or_else(|| bearer.clone().map(ClientId::new))
        .unwrap_or_else(ClientId::anonymous);

    let mut request = Request::new(method, uri.path()).client(client).json(body);
    if let Some(token) = bearer {
        request = request.bearer(token);
    }

    Ok(into_http(state.router.handle(request).await))
}

fn into_http(response: router::Response) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, Json(response.body)).into_response();

    // `Duration::MAX` means the bucket never refills: no useful hint.
    if let Some(retry_after) = response.retry_after.filter(|d| *d != Duration::MAX) {
        // Whole seconds, rounded up so clients never retry early.
        let secs = retry_after
            .as_secs()
            .saturating_add(u64::from(retry_after.subsec_nanos() > 0));
        http.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    if response.degraded {
        http.headers_mut()
            .insert(DEGRADED_HEADER, HeaderValue::from_static("true"));
    }
    http
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    header_str(headers, AUTHORIZATION.as_str())?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
