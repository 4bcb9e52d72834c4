use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-carrier-signature";
/// Optional header with the unix timestamp the sender signed over.
pub const TIMESTAMP_HEADER: &str = "x-carrier-timestamp";

/// Compute the hex HMAC for an outgoing or expected payload. When a
/// timestamp is supplied the signed content is `{timestamp}.` followed
/// by the raw body, otherwise the raw body alone.
pub fn sign_body(secret: &str, timestamp: Option<&str>, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
        mac.update(b".");
    }
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an inbound webhook against the shared secret.
///
/// The signature must cover the raw body exactly as received, before
/// any JSON parsing. If the sender included a timestamp header it is
/// part of the signed content and must be within `tolerance_secs` of
/// the current clock. Any failure maps to the same opaque error so the
/// response does not reveal which check rejected the request.
pub fn verify_webhook(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> Result<(), ServiceError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(ServiceError::SignatureInvalid)?;

    let timestamp = match headers.get(TIMESTAMP_HEADER) {
        Some(raw) => {
            let ts = raw
                .to_str()
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(ServiceError::SignatureInvalid)?;
            let now = chrono::Utc::now().timestamp();
            if (now - ts).unsigned_abs() > tolerance_secs {
                return Err(ServiceError::SignatureInvalid);
            }
            Some(ts.to_string())
        }
        None => None,
    };

    let expected = sign_body(secret, timestamp.as_deref(), body);
    if constant_time_eq(&expected, provided) {
        Ok(())
    } else {
        Err(ServiceError::SignatureInvalid)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "carrier-webhook-secret";

    fn headers_with(sig: &str, ts: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(sig).unwrap());
        if let Some(ts) = ts {
            headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(ts).unwrap());
        }
        headers
    }

    #[test]
    fn accepts_valid_signature_without_timestamp() {
        let body = br#"{"tracking_id":"TRK-1","event":"DELIVERED"}"#;
        let sig = sign_body(SECRET, None, body);
        let headers = headers_with(&sig, None);
        assert!(verify_webhook(&headers, body, SECRET, 300).is_ok());
    }

    #[test]
    fn accepts_valid_signature_with_fresh_timestamp() {
        let body = br#"{"tracking_id":"TRK-1"}"#;
        let ts = chrono::Utc::now().timestamp().to_string();
        let sig = sign_body(SECRET, Some(&ts), body);
        let headers = headers_with(&sig, Some(&ts));
        assert!(verify_webhook(&headers, body, SECRET, 300).is_ok());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let body = br#"{"tracking_id":"TRK-1"}"#;
        let ts = (chrono::Utc::now().timestamp() - 3600).to_string();
        let sig = sign_body(SECRET, Some(&ts), body);
        let headers = headers_with(&sig, Some(&ts));
        assert!(verify_webhook(&headers, body, SECRET, 300).is_err());
    }

    #[test]
    fn rejects_missing_signature_header() {
        let headers = HeaderMap::new();
        assert!(verify_webhook(&headers, b"{}", SECRET, 300).is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = b"payload";
        let sig = sign_body("other-secret", None, body);
        let headers = headers_with(&sig, None);
        assert!(verify_webhook(&headers, body, SECRET, 300).is_err());
    }

    #[test]
    fn rejects_tampered_body() {
        let sig = sign_body(SECRET, None, b"original");
        let headers = headers_with(&sig, None);
        assert!(verify_webhook(&headers, b"tampered", SECRET, 300).is_err());
    }

    #[test]
    fn timestamp_changes_the_signature() {
        let body = b"payload";
        let unsigned_ts = sign_body(SECRET, None, body);
        let with_ts = sign_body(SECRET, Some("1700000000"), body);
        assert_ne!(unsigned_ts, with_ts);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
