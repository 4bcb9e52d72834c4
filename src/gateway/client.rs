use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GatewaySettings;
use crate::errors::ServiceError;

use super::{
    format_amount, intent_digest, parse_inquiry_body, InquiryResult, IntentRequest, PaymentGateway,
    PaymentIntent,
};

/// HTTP client for the payment gateway. Create-intent failures are
/// surfaced to the caller; inquiry failures collapse to `Unknown` so
/// the reconciliation loop can retry on its next pass.
pub struct HttpPaymentGateway {
    client: Client,
    settings: GatewaySettings,
}

#[derive(Debug, Serialize)]
struct CreateIntentBody<'a> {
    merchant_id: &'a str,
    transaction_id: &'a str,
    amount: String,
    currency: &'a str,
    description: &'a str,
    customer_email: &'a str,
    digest: String,
    return_url: &'a str,
    postback_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateIntentResponse {
    redirect_url: String,
}

impl HttpPaymentGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::ExternalUnavailable(format!("failed to build gateway client: {}", e))
            })?;
        Ok(Self::with_client(settings, client))
    }

    /// Build from an existing client (useful for testing).
    pub fn with_client(settings: GatewaySettings, client: Client) -> Self {
        Self { client, settings }
    }
}

#[async_trait::async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent, ServiceError> {
        let digest = intent_digest(
            &self.settings.merchant_id,
            &request.transaction_id,
            request.amount,
            &request.currency,
            &request.description,
            &request.customer_email,
            &self.settings.secret,
        );
        let body = CreateIntentBody {
            merchant_id: &self.settings.merchant_id,
            transaction_id: &request.transaction_id,
            amount: format_amount(request.amount),
            currency: &request.currency,
            description: &request.description,
            customer_email: &request.customer_email,
            digest,
            return_url: &self.settings.return_url,
            postback_url: &self.settings.postback_url,
        };
        let url = format!("{}/payments/intents", self.settings.base_url);

        debug!(
            transaction_id = %request.transaction_id,
            amount = %body.amount,
            "issuing payment intent"
        );

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            ServiceError::ExternalUnavailable(format!("gateway create-intent call failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::ExternalUnavailable(format!(
                "gateway create-intent returned {}: {}",
                status, text
            )));
        }

        let parsed: CreateIntentResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalUnavailable(format!(
                "gateway create-intent response unreadable: {}",
                e
            ))
        })?;

        Ok(PaymentIntent {
            transaction_id: request.transaction_id.clone(),
            redirect_url: parsed.redirect_url,
        })
    }

    async fn inquire(&self, transaction_id: &str) -> InquiryResult {
        let url = format!(
            "{}/payments/inquiry/{}?merchant_id={}",
            self.settings.base_url, transaction_id, self.settings.merchant_id
        );

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(transaction_id, error = %e, "gateway inquiry call failed");
                return InquiryResult::unknown(format!("inquiry call failed: {}", e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(transaction_id, %status, "gateway inquiry returned non-success");
            return InquiryResult::unknown(format!("inquiry returned {}", status));
        }

        match response.text().await {
            Ok(body) => parse_inquiry_body(&body),
            Err(e) => InquiryResult::unknown(format!("inquiry body unreadable: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayStatus;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: String) -> GatewaySettings {
        GatewaySettings {
            base_url,
            merchant_id: "M-TEST".into(),
            secret: "gateway-secret".into(),
            return_url: "http://localhost/payments/return".into(),
            postback_url: "http://localhost/payments/postback".into(),
            timeout_secs: 2,
        }
    }

    fn gateway(server: &MockServer) -> HttpPaymentGateway {
        HttpPaymentGateway::with_client(settings(server.uri()), Client::new())
    }

    #[tokio::test]
    async fn create_intent_returns_redirect_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/intents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "redirect_url": "https://pay.example.com/session/abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = IntentRequest {
            transaction_id: "ORD-1-1".into(),
            amount: dec!(150),
            currency: "PHP".into(),
            description: "Order ORD-1".into(),
            customer_email: "buyer@example.com".into(),
        };
        let intent = gateway(&server).create_intent(&request).await.unwrap();
        assert_eq!(intent.transaction_id, "ORD-1-1");
        assert_eq!(intent.redirect_url, "https://pay.example.com/session/abc");
    }

    #[tokio::test]
    async fn create_intent_maps_gateway_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments/intents"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let request = IntentRequest {
            transaction_id: "ORD-1-1".into(),
            amount: dec!(150),
            currency: "PHP".into(),
            description: "Order ORD-1".into(),
            customer_email: "buyer@example.com".into(),
        };
        let err = gateway(&server).create_intent(&request).await.unwrap_err();
        assert!(matches!(err, ServiceError::ExternalUnavailable(_)));
    }

    #[tokio::test]
    async fn inquire_parses_status_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/inquiry/ORD-1-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("S:Payment received"))
            .mount(&server)
            .await;

        let result = gateway(&server).inquire("ORD-1-1").await;
        assert_eq!(result.status, GatewayStatus::Succeeded);
        assert_eq!(result.message.as_deref(), Some("Payment received"));
    }

    #[tokio::test]
    async fn inquire_non_success_is_typed_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/payments/inquiry/ORD-1-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = gateway(&server).inquire("ORD-1-1").await;
        assert_eq!(result.status, GatewayStatus::Unknown);
        assert!(result.message.is_some());
    }

    #[tokio::test]
    async fn inquire_unreachable_host_is_typed_unknown() {
        // Port reserved then dropped so nothing is listening.
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let client = HttpPaymentGateway::with_client(settings(uri), Client::new());
        let result = client.inquire("ORD-1-1").await;
        assert_eq!(result.status, GatewayStatus::Unknown);
    }
}
