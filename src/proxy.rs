//! Intercepting HTTP listener.
//!
//! The reference host surface: an axum service that treats every incoming
//! request as an intercepted fetch, reconstructs its absolute URL, and runs
//! it through the engine. Network failures surface as gateway errors; dedup
//! timeouts as gateway timeouts so callers can retry.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{StatusCode, Uri, request};
use tracing::warn;

use crate::dedup::DedupError;
use crate::engine::Engine;
use crate::pipeline::PipelineError;

/// Build the proxy router around an engine instance.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new().fallback(intercept).with_state(engine)
}

async fn intercept(
    State(engine): State<Arc<Engine>>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to buffer intercepted request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let Some(uri) = absolute_uri(&parts) else {
        return (
            StatusCode::BAD_REQUEST,
            "intercepted request has no resolvable host",
        )
            .into_response();
    };

    let mut builder = http::Request::builder().method(parts.method.clone()).uri(uri);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    let engine_request = match builder.body(bytes) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "failed to rebuild intercepted request");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match engine.handle(engine_request).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            Response::from_parts(parts, Body::from(body))
        }
        Err(PipelineError::Dedup(DedupError::Timeout { .. })) => {
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        Err(err) => {
            warn!(error = %err, "intercepted request failed upstream");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Reconstruct the absolute request URL.
///
/// Proxy-style absolute-form URIs pass through; origin-form requests are
/// resolved against the `Host` header.
fn absolute_uri(parts: &request::Parts) -> Option<Uri> {
    if parts.uri.authority().is_some() {
        return Some(parts.uri.clone());
    }

    let host = parts.headers.get(http::header::HOST)?.to_str().ok()?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|paq| paq.as_str())
        .unwrap_or("/");
    format!("http://{host}{path_and_query}").parse().ok()
}
