//! Provider status callbacks

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use relaycast_core::reconcile::{verify_signature, ProviderCallback, ReconcileOutcome};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::AppState;
use crate::error::{api_error, error_response, ApiError, ApiResult};

pub const SIGNATURE_HEADER: &str = "x-relaycast-signature";

/// Status update as posted by a provider
#[derive(Debug, Deserialize)]
pub struct StatusCallbackPayload {
    pub event_id: Option<String>,
    #[serde(alias = "message_id")]
    pub external_id: String,
    pub status: String,
    #[serde(alias = "error_message")]
    pub error: Option<String>,
    pub cost: Option<f64>,
    #[serde(alias = "timestamp")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl StatusCallbackPayload {
    fn into_callback(self, provider_name: String) -> ProviderCallback {
        ProviderCallback {
            provider_name,
            event_id: self.event_id,
            external_id: self.external_id,
            status: self.status,
            error: self.error,
            cost: self.cost,
            occurred_at: self.occurred_at,
        }
    }
}

/// Check the body signature when a webhook secret is configured
pub fn authorize(secret: Option<&str>, headers: &HeaderMap, body: &[u8]) -> ApiResult<()> {
    let Some(secret) = secret else {
        return Ok(());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Missing signature")
        })?;

    if !verify_signature(secret, body, signature) {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Invalid signature",
        ));
    }
    Ok(())
}

fn unknown_message(external_id: &str) -> ApiError {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "UNKNOWN_MESSAGE",
        format!("No message with provider id {} yet, redeliver later", external_id),
    )
}

fn parse_payload(body: &[u8]) -> Result<StatusCallbackPayload, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_PAYLOAD",
            format!("Invalid callback payload: {}", e),
        )
    })
}

/// Apply a provider's delivery status report.
///
/// Replays answer 200 with a `duplicate` result so providers stop retrying.
/// A callback for a message not recorded yet answers 503 so the provider
/// redelivers it.
pub async fn provider_status(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ReconcileOutcome>> {
    if let Err(rejection) = authorize(state.webhook_secret.as_deref(), &headers, &body) {
        warn!(provider = %provider, "Rejected unsigned or mis-signed callback");
        return Err(rejection);
    }

    if state.router.registry().get(&provider).is_none() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Provider {} not registered", provider),
        ));
    }

    let callback = parse_payload(&body)?.into_callback(provider);
    let outcome = state
        .reconciler
        .apply(&callback)
        .await
        .map_err(api_error)?;

    if !outcome.settles_event() {
        return Err(unknown_message(&callback.external_id));
    }

    debug!(
        provider = %callback.provider_name,
        external_id = %callback.external_id,
        result = outcome.as_str(),
        "Callback processed"
    );
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use relaycast_core::reconcile::sign;

    const BODY: &[u8] = br#"{"event_id":"evt_1","message_id":"SM42","status":"delivered","cost":0.0079}"#;

    #[test]
    fn unsigned_callbacks_pass_without_a_secret() {
        assert!(authorize(None, &HeaderMap::new(), BODY).is_ok());
    }

    #[test]
    fn signature_is_required_with_a_secret() {
        let (status, Json(body)) = authorize(Some("whsec"), &HeaderMap::new(), BODY).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.message, "Missing signature");

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("bm9wZQ=="));
        let (status, _) = authorize(Some("whsec"), &headers, BODY).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign("whsec", BODY)).unwrap(),
        );
        assert!(authorize(Some("whsec"), &headers, BODY).is_ok());
    }

    #[test]
    fn payload_accepts_provider_aliases() {
        let callback = parse_payload(BODY).unwrap().into_callback("twilio".into());
        assert_eq!(callback.external_id, "SM42");
        assert_eq!(callback.event_id.as_deref(), Some("evt_1"));
        assert_eq!(callback.cost, Some(0.0079));
        assert_eq!(callback.provider_name, "twilio");
    }

    #[test]
    fn unknown_message_asks_for_redelivery() {
        let (status, Json(body)) = unknown_message("SM42");
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error, "UNKNOWN_MESSAGE");
        assert!(body.message.contains("SM42"));
    }

    #[test]
    fn malformed_payload_is_a_bad_request() {
        let (status, _) = parse_payload(b"{\"status\":\"delivered\"}").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
