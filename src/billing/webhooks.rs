use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::EventBus;

use super::service::BillingService;

/// key: billing-webhooks -> signature-verified provider entrypoint

const SIGNATURE_HEADER: &str = "stripe-signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub fn routes() -> Router {
    Router::new().route("/webhooks/stripe", post(stripe_webhook))
}

/// Verify a `t=...,v1=...` signature header: HMAC-SHA256 over
/// `"{timestamp}.{payload}"` with the shared endpoint secret.
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    now_epoch: i64,
) -> AppResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| {
        AppError::validation("billing.invalid_signature", "missing signature timestamp")
    })?;
    if (now_epoch - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(AppError::validation(
            "billing.invalid_signature",
            "signature timestamp outside tolerance",
        ));
    }

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    if signatures.iter().any(|sig| *sig == expected) {
        return Ok(());
    }
    Err(AppError::validation(
        "billing.invalid_signature",
        "signature mismatch",
    ))
}

/// Authentication-free by design; the signature is the authentication. No
/// actor resolution happens on this path. Unknown event types return 200.
async fn stripe_webhook(
    Extension(pool): Extension<sqlx::PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(bus): Extension<EventBus>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::validation("billing.invalid_signature", "missing signature header")
        })?;
    verify_signature(
        &config.billing.stripe.webhook_secret,
        &body,
        header,
        Utc::now().timestamp(),
    )?;

    let envelope: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::validation("request.invalid_body", "malformed webhook payload"))?;
    let event_id = envelope["id"].as_str().unwrap_or_default();
    let event_type = envelope["type"].as_str().unwrap_or_default();
    if event_id.is_empty() || event_type.is_empty() {
        return Err(AppError::validation(
            "request.invalid_body",
            "webhook payload missing id or type",
        ));
    }

    let service = BillingService::new(pool);
    let events = service
        .apply_webhook(event_id, event_type, &envelope["data"]["object"])
        .await?;
    for event in events {
        bus.publish(event).await;
    }
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8], timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", payload, 1_700_000_000);
        assert!(verify_signature("whsec_test", payload, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let header = sign("whsec_test", br#"{"id":"evt_1"}"#, 1_700_000_000);
        assert!(
            verify_signature("whsec_test", br#"{"id":"evt_2"}"#, &header, 1_700_000_000).is_err()
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", payload, 1_700_000_000);
        assert!(verify_signature("whsec_other", payload, &header, 1_700_000_000).is_err());
    }

    #[test]
    fn stale_timestamp_fails() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", payload, 1_700_000_000);
        assert!(verify_signature(
            "whsec_test",
            payload,
            &header,
            1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1
        )
        .is_err());
    }

    #[test]
    fn header_without_v1_fails() {
        assert!(verify_signature("whsec_test", b"{}", "t=1700000000", 1_700_000_000).is_err());
    }
}
