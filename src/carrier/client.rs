use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CarrierSettings;
use crate::errors::ServiceError;

use super::{CarrierApi, CreateShipmentRequest, ShipmentCreated};

/// HTTP client for the carrier's shipment API.
pub struct HttpCarrierApi {
    client: Client,
    settings: CarrierSettings,
}

#[derive(Debug, Deserialize)]
struct CreateShipmentResponse {
    tracking_number: String,
}

#[derive(Debug, Deserialize)]
struct CarrierErrorBody {
    #[serde(default)]
    message: String,
}

impl HttpCarrierApi {
    pub fn new(settings: CarrierSettings) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::ExternalUnavailable(format!("failed to build carrier client: {}", e))
            })?;
        Ok(Self::with_client(settings, client))
    }

    /// Build from an existing client (useful for testing).
    pub fn with_client(settings: CarrierSettings, client: Client) -> Self {
        Self { client, settings }
    }

    fn url(&self, tail: &str) -> String {
        format!("{}{}", self.settings.base_url, tail)
    }
}

#[async_trait::async_trait]
impl CarrierApi for HttpCarrierApi {
    async fn create_shipment(
        &self,
        request: &CreateShipmentRequest,
    ) -> Result<ShipmentCreated, ServiceError> {
        let body = serde_json::json!({
            "request_id": request.request_id,
            "sender_name": self.settings.sender_name,
            "sender_address": self.settings.sender_address,
            "recipient_address": request.recipient_address,
            "recipient_email": request.recipient_email,
            "weight_kg": request.weight_kg,
            "cod_amount": request.cod_amount,
            "currency": request.currency,
            "description": request.description,
        });

        debug!(request_id = %request.request_id, "requesting shipment from carrier");

        let response = self
            .client
            .post(self.url("/shipments"))
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalUnavailable(format!("carrier create call failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceError::ExternalUnavailable(format!(
                "carrier create returned {}: {}",
                status, text
            )));
        }

        let parsed: CreateShipmentResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalUnavailable(format!("carrier create response unreadable: {}", e))
        })?;

        Ok(ShipmentCreated {
            tracking_number: parsed.tracking_number,
        })
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(self.url(&format!("/shipments/{}/cancel", tracking_number)))
            .bearer_auth(&self.settings.api_key)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalUnavailable(format!("carrier cancel call failed: {}", e))
            })?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(()),
            // The carrier answers 409 once the parcel is past pickup.
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                let body: CarrierErrorBody = response.json().await.unwrap_or(CarrierErrorBody {
                    message: "shipment can no longer be cancelled".into(),
                });
                warn!(tracking_number, reason = %body.message, "carrier rejected cancellation");
                Err(ServiceError::PreconditionFailed(body.message))
            }
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(format!(
                "carrier has no shipment {}",
                tracking_number
            ))),
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(ServiceError::ExternalUnavailable(format!(
                    "carrier cancel returned {}: {}",
                    status, text
                )))
            }
        }
    }

    async fn get_waybill(&self, tracking_number: &str) -> Result<Vec<u8>, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/shipments/{}/waybill", tracking_number)))
            .bearer_auth(&self.settings.api_key)
            .send()
            .await
            .map_err(|e| {
                ServiceError::ExternalUnavailable(format!("carrier waybill call failed: {}", e))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(format!(
                "no waybill for {}",
                tracking_number
            )));
        }
        if !status.is_success() {
            return Err(ServiceError::ExternalUnavailable(format!(
                "carrier waybill returned {}",
                status
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            ServiceError::ExternalUnavailable(format!("carrier waybill body unreadable: {}", e))
        })?;
        Ok(bytes.to_vec())
    }
}
