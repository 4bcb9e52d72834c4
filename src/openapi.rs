use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Orderflow API",
        version = env!("CARGO_PKG_VERSION"),
        description = r#"
# Orderflow Order Lifecycle API

Keeps order, payment and shipment state consistent across a payment
gateway and a shipping carrier.

## How state moves

Every status change goes through one state machine. Gateway callbacks,
carrier webhooks, the reconciliation poller and user actions all submit
transition requests; unreachable targets and replayed events become
no-ops instead of errors, so event sources can deliver late, twice or
out of order.

## Authentication

Caller identity arrives via the `x-user-id` and `x-user-role` headers,
set by the gateway in front of this service. Webhook endpoints are
authenticated by HMAC signature instead and ignore identity headers.

## Envelope

Success bodies use the `ApiResponse` envelope (`success`, `data`,
`message`, `errors`, `meta.request_id`). Errors render an
`ErrorResponse` with the request id for support correlation.
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "orders", description = "Checkout, order detail, cancellation and tracking"),
        (name = "shipments", description = "Shipment detail and waybill proxy"),
        (name = "stock", description = "Stock levels and ledgered adjustments"),
        (name = "payments", description = "Gateway return and postback callbacks"),
        (name = "webhooks", description = "Inbound carrier status events"),
        (name = "outbox", description = "Durable side-effect queue administration"),
        (name = "health", description = "Probes"),
    ),
    paths(
        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::order_tracking,
        crate::handlers::orders::create_order_shipment,

        // Shipments
        crate::handlers::shipments::get_shipment,
        crate::handlers::shipments::get_waybill,

        // Stock
        crate::handlers::stock::get_stock,
        crate::handlers::stock::adjust_stock,

        // Payments
        crate::handlers::gateway_callbacks::payment_return,
        crate::handlers::gateway_callbacks::payment_postback,

        // Carrier webhooks
        crate::handlers::carrier_webhooks::carrier_webhook_v1,
        crate::handlers::carrier_webhooks::carrier_webhook_v2,

        // Outbox administration
        crate::handlers::outbox_admin::outbox_stats,
        crate::handlers::outbox_admin::retry_failed,

        // Health
        crate::handlers::health::health,
        crate::handlers::health::live,
        crate::handlers::health::ready,
    ),
    components(
        schemas(
            // Common types
            crate::ApiResponse<serde_json::Value>,
            crate::errors::ErrorResponse,

            // Order types
            crate::services::orders::CreateOrderRequest,
            crate::services::orders::OrderItemRequest,
            crate::services::orders::OrderResponse,
            crate::services::orders::OrderItemResponse,
            crate::services::orders::OrderDetailResponse,
            crate::services::orders::CheckoutResponse,
            crate::services::orders::OrderListResponse,
            crate::services::orders::TrackingEventResponse,
            crate::services::orders::OrderTrackingResponse,

            // Shipment types
            crate::handlers::shipments::ShipmentResponse,

            // Stock types
            crate::services::stock::StockItemResponse,
            crate::services::stock::AdjustStockRequest,

            // Payment callback types
            crate::handlers::gateway_callbacks::CallbackParams,

            // Outbox types
            crate::events::outbox::OutboxStats,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "ApiKey",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("x-user-id"))),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_builds_and_lists_every_surface() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/orders"));
        assert!(paths.iter().any(|p| p.as_str() == "/webhooks/carrier/v2"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/payments/postback"));
        assert!(paths.iter().any(|p| p.as_str() == "/health/ready"));
    }

    #[test]
    fn security_scheme_is_registered() {
        let doc = ApiDoc::openapi();
        let components = doc.components.expect("components expected");
        assert!(components.security_schemes.contains_key("ApiKey"));
    }
}
