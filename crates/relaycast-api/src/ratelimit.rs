//! Per-caller API rate limiting

use axum::{
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use relaycast_core::ratelimit::{RateLimitKey, RateLimitStatus};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::auth::{AppState, AuthContext};

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Client address as reported by the fronting proxy
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Attach `X-RateLimit-*` headers when a limit governs the request
pub fn apply_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    if status.window_secs == 0 {
        return;
    }
    let values = [
        (LIMIT_HEADER, status.max_requests.to_string()),
        (REMAINING_HEADER, status.remaining.max(0).to_string()),
        (RESET_HEADER, status.reset_at.timestamp().to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Path as the client sent it; nested routers only see their own suffix
pub fn request_path(request: &Request) -> String {
    request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

fn limited_response(status: &RateLimitStatus, endpoint: &str) -> Response {
    let retry_after = status.retry_after_secs.unwrap_or(status.window_secs.max(1) as u64);
    let body = json!({
        "error": "RATE_LIMITED",
        "message": format!(
            "Rate limit of {} requests per {} seconds exceeded for this endpoint",
            status.max_requests, status.window_secs
        ),
        "retry_after": retry_after,
        "reset_at": status.reset_at,
        "endpoint": endpoint,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_headers(response.headers_mut(), status);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

/// Consume one request from the caller's governing limit.
///
/// Runs after authentication. Limiter failures let the request through.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = request.extensions().get::<AuthContext>().cloned() else {
        return next.run(request).await;
    };

    let key = RateLimitKey {
        user_id: auth.user_id,
        tenant_id: Some(auth.tenant_id),
        endpoint: request_path(&request),
        ip_address: client_ip(request.headers()),
    };

    let status = match state.rate_limiter.check_and_record(&key).await {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, endpoint = %key.endpoint, "Rate limiter unavailable, admitting request");
            return next.run(request).await;
        }
    };

    if status.limited {
        return limited_response(&status, &key.endpoint);
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &status);
    response
}
