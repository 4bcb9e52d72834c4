pub mod client;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ServiceError;

pub use client::HttpPaymentGateway;

/// Normalized gateway-side transaction status.
///
/// `Unknown` covers both unrecognized status codes and transport
/// failures during inquiry, so callers can always retry later without
/// special-casing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatewayStatus {
    Succeeded,
    Failed,
    Pending,
    Unknown,
    Refunded,
    Chargeback,
    Voided,
    Authorized,
}

impl GatewayStatus {
    /// Map the gateway's single-letter status code. Codes outside the
    /// documented set fall through to `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "S" => GatewayStatus::Succeeded,
            "F" => GatewayStatus::Failed,
            "P" => GatewayStatus::Pending,
            "U" => GatewayStatus::Unknown,
            "R" => GatewayStatus::Refunded,
            "K" => GatewayStatus::Chargeback,
            "V" => GatewayStatus::Voided,
            "A" => GatewayStatus::Authorized,
            _ => GatewayStatus::Unknown,
        }
    }

    pub fn is_definitive(&self) -> bool {
        !matches!(self, GatewayStatus::Pending | GatewayStatus::Unknown)
    }
}

/// Outcome of an inquiry call. Never an error: anything that prevented
/// a definitive answer is reported as `Unknown` with the cause in
/// `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryResult {
    pub status: GatewayStatus,
    pub message: Option<String>,
}

impl InquiryResult {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: GatewayStatus::Unknown,
            message: Some(message.into()),
        }
    }
}

/// Parse the inquiry response body, either a bare status code or
/// `code:message`.
pub fn parse_inquiry_body(body: &str) -> InquiryResult {
    let trimmed = body.trim();
    let (code, message) = match trimmed.split_once(':') {
        Some((code, message)) => (code, Some(message.trim())),
        None => (trimmed, None),
    };
    InquiryResult {
        status: GatewayStatus::from_code(code),
        message: message.filter(|m| !m.is_empty()).map(str::to_owned),
    }
}

/// Fields the gateway signs over when an intent is created.
#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub customer_email: String,
}

/// What the gateway hands back for a freshly created intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub transaction_id: String,
    pub redirect_url: String,
}

/// Serialize an amount with exactly two decimal digits. The gateway
/// computes its own digest over the string form, so "10" and "10.00"
/// are different payloads to it.
pub fn format_amount(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.2}", rounded)
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Digest sent with a create-intent call. Field order is part of the
/// gateway contract and must not change.
pub fn intent_digest(
    merchant_id: &str,
    transaction_id: &str,
    amount: Decimal,
    currency: &str,
    description: &str,
    customer_email: &str,
    secret: &str,
) -> String {
    let amount = format_amount(amount);
    sha256_hex(&[
        merchant_id,
        transaction_id,
        &amount,
        currency,
        description,
        customer_email,
        secret,
    ])
}

/// Digest the gateway attaches to server-to-server postbacks. Covers a
/// different field set than the intent digest.
pub fn callback_digest(
    transaction_id: &str,
    reference_number: &str,
    status: &str,
    message: &str,
    secret: &str,
) -> String {
    sha256_hex(&[transaction_id, reference_number, status, message, secret])
}

/// Verify a postback digest without leaking which byte differed.
pub fn verify_callback_digest(
    transaction_id: &str,
    reference_number: &str,
    status: &str,
    message: &str,
    secret: &str,
    provided: &str,
) -> Result<(), ServiceError> {
    let expected = callback_digest(transaction_id, reference_number, status, message, secret);
    if expected.len() == provided.len() {
        let mut diff = 0u8;
        for (a, b) in expected.as_bytes().iter().zip(provided.as_bytes()) {
            diff |= a ^ b;
        }
        if diff == 0 {
            return Ok(());
        }
    }
    Err(ServiceError::SignatureInvalid)
}

/// Client-side view of the payment gateway. `inquire` is infallible by
/// contract: transport and parse problems surface as `Unknown`.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, ServiceError>;

    async fn inquire(&self, transaction_id: &str) -> InquiryResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    #[test_case("S", GatewayStatus::Succeeded ; "succeeded")]
    #[test_case("F", GatewayStatus::Failed ; "failed")]
    #[test_case("P", GatewayStatus::Pending ; "pending")]
    #[test_case("U", GatewayStatus::Unknown ; "unknown")]
    #[test_case("R", GatewayStatus::Refunded ; "refunded")]
    #[test_case("K", GatewayStatus::Chargeback ; "chargeback")]
    #[test_case("V", GatewayStatus::Voided ; "voided")]
    #[test_case("A", GatewayStatus::Authorized ; "authorized")]
    #[test_case("s", GatewayStatus::Succeeded ; "lowercase accepted")]
    #[test_case("X", GatewayStatus::Unknown ; "unrecognized code")]
    #[test_case("", GatewayStatus::Unknown ; "empty body")]
    #[test_case("SS", GatewayStatus::Unknown ; "multi letter")]
    fn status_code_mapping(code: &str, expected: GatewayStatus) {
        assert_eq!(GatewayStatus::from_code(code), expected);
    }

    #[test]
    fn inquiry_body_with_message() {
        let result = parse_inquiry_body("F:Insufficient funds");
        assert_eq!(result.status, GatewayStatus::Failed);
        assert_eq!(result.message.as_deref(), Some("Insufficient funds"));
    }

    #[test]
    fn inquiry_body_bare_code() {
        let result = parse_inquiry_body("  S  ");
        assert_eq!(result.status, GatewayStatus::Succeeded);
        assert_eq!(result.message, None);
    }

    #[test]
    fn inquiry_body_empty_message_is_none() {
        let result = parse_inquiry_body("S:");
        assert_eq!(result.status, GatewayStatus::Succeeded);
        assert_eq!(result.message, None);
    }

    #[test]
    fn amount_always_two_decimals() {
        assert_eq!(format_amount(dec!(10)), "10.00");
        assert_eq!(format_amount(dec!(10.5)), "10.50");
        assert_eq!(format_amount(dec!(19.999)), "20.00");
        assert_eq!(format_amount(dec!(10.005)), "10.01");
        assert_eq!(format_amount(dec!(0)), "0.00");
    }

    #[test]
    fn intent_digest_is_hex_and_field_sensitive() {
        let base = intent_digest(
            "M-1",
            "ORD-1-1",
            dec!(100),
            "PHP",
            "Order ORD-1",
            "buyer@example.com",
            "secret",
        );
        assert_eq!(base.len(), 64);
        assert!(base.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(base.chars().all(|c| !c.is_ascii_uppercase()));

        let other_amount = intent_digest(
            "M-1",
            "ORD-1-1",
            dec!(100.01),
            "PHP",
            "Order ORD-1",
            "buyer@example.com",
            "secret",
        );
        assert_ne!(base, other_amount);

        let other_secret = intent_digest(
            "M-1",
            "ORD-1-1",
            dec!(100),
            "PHP",
            "Order ORD-1",
            "buyer@example.com",
            "other",
        );
        assert_ne!(base, other_secret);
    }

    #[test]
    fn trailing_zeros_do_not_change_the_digest() {
        let a = intent_digest("M-1", "T-1", dec!(25), "PHP", "d", "e@x.com", "s");
        let b = intent_digest("M-1", "T-1", dec!(25.00), "PHP", "d", "e@x.com", "s");
        assert_eq!(a, b);
    }

    #[test]
    fn callback_digest_round_trip() {
        let digest = callback_digest("T-1", "REF-9", "S", "ok", "secret");
        assert!(verify_callback_digest("T-1", "REF-9", "S", "ok", "secret", &digest).is_ok());
        assert!(verify_callback_digest("T-1", "REF-9", "F", "ok", "secret", &digest).is_err());
        assert!(verify_callback_digest("T-1", "REF-9", "S", "ok", "other", &digest).is_err());
        assert!(verify_callback_digest("T-1", "REF-9", "S", "ok", "secret", "deadbeef").is_err());
    }

    #[test]
    fn callback_digest_differs_from_intent_digest() {
        let intent = intent_digest("M-1", "T-1", dec!(1), "PHP", "S", "ok", "secret");
        let callback = callback_digest("T-1", "REF", "S", "ok", "secret");
        assert_ne!(intent, callback);
    }
}
