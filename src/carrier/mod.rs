pub mod client;
pub mod events;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;

pub use client::HttpCarrierApi;
pub use events::{canonical_event_name, map_v1_event, map_v2_event, MappedEvent};

/// Payload for a shipment-creation call. The request id doubles as the
/// carrier-side idempotency token, so it must be stable per order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShipmentRequest {
    pub request_id: String,
    pub recipient_address: String,
    pub recipient_email: String,
    pub weight_kg: Decimal,
    pub cod_amount: Option<Decimal>,
    pub currency: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentCreated {
    pub tracking_number: String,
}

/// Parcel weight: half a kilo of packaging plus half a kilo per unit.
pub fn parcel_weight_kg(total_units: i32) -> Decimal {
    dec!(0.5) + Decimal::from(total_units.max(0)) * dec!(0.5)
}

/// Outbound carrier operations. Webhook ingestion lives in the
/// handlers; this trait only covers calls we originate.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CarrierApi: Send + Sync {
    async fn create_shipment(
        &self,
        request: &CreateShipmentRequest,
    ) -> Result<ShipmentCreated, ServiceError>;

    /// Rejected by the carrier once the parcel is past pickup; that
    /// surfaces as `PreconditionFailed`, not a retryable error.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError>;

    /// Waybill PDF bytes, proxied as-is.
    async fn get_waybill(&self, tracking_number: &str) -> Result<Vec<u8>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_scales_with_units() {
        assert_eq!(parcel_weight_kg(0), dec!(0.5));
        assert_eq!(parcel_weight_kg(1), dec!(1.0));
        assert_eq!(parcel_weight_kg(2), dec!(1.5));
        assert_eq!(parcel_weight_kg(10), dec!(5.5));
    }

    #[test]
    fn weight_treats_negative_units_as_empty() {
        assert_eq!(parcel_weight_kg(-3), dec!(0.5));
    }
}
