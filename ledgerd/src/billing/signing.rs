//! HMAC-SHA256 webhook signatures (Standard Webhooks layout).
//!
//! The signed content is `{id}.{timestamp}.{body}` and the signature header
//! carries `v1,` + base64(HMAC-SHA256). Secrets are `whsec_` + base64 so they
//! can be pasted between services without ambiguity.
//!
//! See: <https://www.standardwebhooks.com/>

use axum::http::HeaderMap;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Delivery id header; doubles as the event id for dedup
pub const HEADER_ID: &str = "webhook-id";
/// Unix-seconds timestamp header
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
/// Signature header, `v1,{base64}`
pub const HEADER_SIGNATURE: &str = "webhook-signature";

/// Generate a new `whsec_` prefixed secret (32 random bytes, base64-encoded)
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);

    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

/// Raw secret bytes from a `whsec_` prefixed secret.
///
/// Returns `None` when the prefix is missing or the remainder is not base64.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX)?;
    BASE64_STANDARD.decode(encoded).ok()
}

/// Sign `{msg_id}.{timestamp}.{payload}` with the given secret.
///
/// Returns the signature as `v1,{base64-hmac-sha256}`, or `None` when the
/// secret cannot be decoded.
pub fn sign_payload(msg_id: &str, timestamp: i64, payload: &str, secret: &str) -> Option<String> {
    let secret_bytes = decode_secret(secret)?;

    let signed_content = format!("{msg_id}.{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(&secret_bytes).ok()?;
    mac.update(signed_content.as_bytes());
    let signature = mac.finalize().into_bytes();

    Some(format!("v1,{}", BASE64_STANDARD.encode(signature)))
}

/// Check a received signature against the expected one.
///
/// Comparison is constant-time; any decoding failure counts as a mismatch.
pub fn verify_signature(msg_id: &str, timestamp: i64, payload: &str, signature: &str, secret: &str) -> bool {
    let Some(received) = signature.strip_prefix("v1,") else {
        return false;
    };

    let Some(expected) = sign_payload(msg_id, timestamp, payload, secret) else {
        return false;
    };
    let Some(expected) = expected.strip_prefix("v1,") else {
        return false;
    };

    constant_time_eq(received.as_bytes(), expected.as_bytes())
}

/// The three Standard Webhooks headers, as received on a delivery.
#[derive(Debug, Clone)]
pub struct DeliveryHeaders {
    pub id: String,
    pub timestamp: i64,
    pub signature: String,
}

impl DeliveryHeaders {
    /// Pull id, timestamp, and signature out of the request headers.
    /// Any missing, non-ASCII, or non-numeric-timestamp header yields `None`.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| headers.get(name)?.to_str().ok().map(str::to_string);

        Some(Self {
            id: get(HEADER_ID)?,
            timestamp: get(HEADER_TIMESTAMP)?.parse().ok()?,
            signature: get(HEADER_SIGNATURE)?,
        })
    }

    /// Whether the delivery timestamp is within `tolerance` of `now`.
    /// Bounded in both directions, so replayed and pre-dated deliveries
    /// both fail.
    pub fn is_fresh(&self, now: DateTime<Utc>, tolerance: Duration) -> bool {
        let skew = (now.timestamp() - self.timestamp).unsigned_abs();
        skew <= tolerance.as_secs()
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_generated_secret_round_trips() {
        let secret = generate_secret();
        assert!(secret.starts_with(SECRET_PREFIX));

        let decoded = decode_secret(&secret).expect("generated secret should decode");
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_decode_rejects_bad_secrets() {
        assert!(decode_secret("nosuchprefix_abc").is_none());
        assert!(decode_secret("whsec_!!not base64!!").is_none());
    }

    #[test]
    fn test_sign_and_verify() {
        let secret = generate_secret();
        let msg_id = "evt_42";
        let timestamp = 1736848800; // 2025-01-14 10:00:00 UTC
        let payload = r#"{"type":"subscription.renewed","data":{"subscription_id":"sub_1"}}"#;

        let signature = sign_payload(msg_id, timestamp, payload, &secret).expect("should sign");
        assert!(signature.starts_with("v1,"));

        assert!(verify_signature(msg_id, timestamp, payload, &signature, &secret));

        // Any tampered component fails
        assert!(!verify_signature(msg_id, timestamp, r#"{"type":"other"}"#, &signature, &secret));
        assert!(!verify_signature(msg_id, timestamp + 1, payload, &signature, &secret));
        assert!(!verify_signature("evt_43", timestamp, payload, &signature, &secret));
        assert!(!verify_signature(msg_id, timestamp, payload, &signature, &generate_secret()));
    }

    #[test]
    fn test_verify_rejects_unknown_signature_versions() {
        let secret = generate_secret();
        assert!(!verify_signature("id", 123, "payload", "garbage", &secret));
        assert!(!verify_signature("id", 123, "payload", "v2,abcd", &secret));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let secret = "whsec_bGVkZ2VyZC10ZXN0LXdlYmhvb2stc2VjcmV0LTAwMDE=";
        let a = sign_payload("evt_1", 1736848800, r#"{"test":1}"#, secret).expect("should sign");
        let b = sign_payload("evt_1", 1736848800, r#"{"test":1}"#, secret).expect("should sign");
        assert_eq!(a, b);
    }

    #[test]
    fn test_delivery_headers_parse() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ID, HeaderValue::from_static("evt_7"));
        headers.insert(HEADER_TIMESTAMP, HeaderValue::from_static("1736848800"));
        headers.insert(HEADER_SIGNATURE, HeaderValue::from_static("v1,abcd"));

        let delivery = DeliveryHeaders::from_headers(&headers).expect("should parse");
        assert_eq!(delivery.id, "evt_7");
        assert_eq!(delivery.timestamp, 1736848800);
        assert_eq!(delivery.signature, "v1,abcd");

        // Missing or malformed headers are rejected
        headers.remove(HEADER_TIMESTAMP);
        assert!(DeliveryHeaders::from_headers(&headers).is_none());

        headers.insert(HEADER_TIMESTAMP, HeaderValue::from_static("not-a-number"));
        assert!(DeliveryHeaders::from_headers(&headers).is_none());
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let tolerance = Duration::from_secs(300);

        let fresh = DeliveryHeaders {
            id: "evt_1".to_string(),
            timestamp: now.timestamp() - 60,
            signature: String::new(),
        };
        assert!(fresh.is_fresh(now, tolerance));

        let stale = DeliveryHeaders {
            timestamp: now.timestamp() - 600,
            ..fresh.clone()
        };
        assert!(!stale.is_fresh(now, tolerance));

        // A timestamp from the future is just as suspect
        let predated = DeliveryHeaders {
            timestamp: now.timestamp() + 600,
            ..fresh
        };
        assert!(!predated.is_fresh(now, tolerance));
    }
}
