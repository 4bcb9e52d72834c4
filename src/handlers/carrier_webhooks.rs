use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{ActiveModelTrait, Set};
use serde::Deserialize;
use tracing::{info, warn};

use crate::carrier::events::{canonical_event_name, map_v1_event, map_v2_event, MappedEvent};
use crate::entities::{shipment, tracking_event, webhook_event};
use crate::errors::ServiceError;
use crate::services::transitions::{ShipmentUpdate, TransitionOutcome, TransitionRequest};
use crate::signature;
use crate::state_machine::TransitionSource;
use crate::AppState;

/// Status string recorded on audit rows for events outside the mapping
/// tables. The row is still worth keeping; the carrier ships new event
/// names faster than we map them.
const NO_OP_STATUS: &str = "no_op";

/// Legacy webhook body. The v1 feed predates event ids, so `timestamp`
/// doubles as the idempotency discriminator when present.
#[derive(Debug, Deserialize)]
pub struct CarrierV1Payload {
    pub tracking_id: String,
    pub event: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// Current webhook body. `event_id` is the carrier's own delivery id and
/// wins as the idempotency key when present.
#[derive(Debug, Deserialize)]
pub struct CarrierV2Payload {
    pub tracking_number: String,
    pub event_name: String,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/webhooks/carrier",
    summary = "Carrier webhook (legacy vocabulary)",
    description = "Inbound status events from the carrier's v1 feed. The raw body must be signed with HMAC-SHA256 in the x-carrier-signature header",
    request_body = String,
    responses(
        (status = 200, description = "Event accepted (a no-op is still accepted)"),
        (status = 400, description = "Payload is not parseable or misses required fields"),
        (status = 401, description = "Signature missing, stale or wrong"),
    ),
    tag = "webhooks"
)]
pub async fn carrier_webhook_v1(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), ServiceError> {
    if let Err(e) = signature::verify_webhook(
        &headers,
        &body,
        &state.config.carrier.webhook_secret_v1,
        state.config.carrier.webhook_tolerance_secs,
    ) {
        counter!("orderflow.webhooks.rejected", 1, "version" => "v1");
        return Err(e);
    }
    counter!("orderflow.webhooks.received", 1, "version" => "v1");

    let payload: CarrierV1Payload = parse_payload(&body)?;
    require_field(&payload.tracking_id, "tracking_id")?;
    require_field(&payload.event, "event")?;

    let mapped = map_v1_event(&payload.event);
    let canonical = canonical_event_name(&payload.event);
    let event_signature = carrier_event_signature(None, &canonical, payload.timestamp);
    let event_at = payload.timestamp.unwrap_or_else(Utc::now);

    let Some(shipment) = find_shipment(&state, &payload.tracking_id, "v1").await? else {
        return Ok((StatusCode::OK, "ok"));
    };

    let description = payload
        .remarks
        .clone()
        .unwrap_or_else(|| payload.event.clone());
    record_tracking_event(
        &state,
        &shipment,
        &mapped,
        &description,
        payload.location.clone(),
        event_at,
        &body,
    )
    .await?;

    apply_carrier_transition(
        &state,
        &shipment,
        &mapped,
        &canonical,
        event_signature,
        event_at,
        None,
    )
    .await?;

    Ok((StatusCode::OK, "ok"))
}

#[utoipa::path(
    post,
    path = "/webhooks/carrier/v2",
    summary = "Carrier webhook (current vocabulary)",
    description = "Inbound status events from the carrier's v2 feed, with exception and customs states. Every authentic delivery is journaled to the webhook event log before any transition is attempted",
    request_body = String,
    responses(
        (status = 200, description = "Event accepted (a no-op is still accepted)"),
        (status = 400, description = "Payload is not parseable or misses required fields"),
        (status = 401, description = "Signature missing, stale or wrong"),
    ),
    tag = "webhooks"
)]
pub async fn carrier_webhook_v2(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), ServiceError> {
    if let Err(e) = signature::verify_webhook(
        &headers,
        &body,
        &state.config.carrier.webhook_secret_v2,
        state.config.carrier.webhook_tolerance_secs,
    ) {
        counter!("orderflow.webhooks.rejected", 1, "version" => "v2");
        return Err(e);
    }
    counter!("orderflow.webhooks.received", 1, "version" => "v2");

    let payload: CarrierV2Payload = parse_payload(&body)?;
    require_field(&payload.tracking_number, "tracking_number")?;
    require_field(&payload.event_name, "event_name")?;

    let mapped = map_v2_event(&payload.event_name);
    let canonical = canonical_event_name(&payload.event_name);
    let event_signature = carrier_event_signature(
        payload.event_id.as_deref(),
        &canonical,
        payload.occurred_at,
    );
    let event_at = payload.occurred_at.unwrap_or_else(Utc::now);

    // Journal first. Rejected transitions and unknown tracking numbers
    // must stay visible to support, so this row exists even when nothing
    // below finds a shipment to move.
    let journal = webhook_event::ActiveModel {
        tracking_id: Set(payload.tracking_number.clone()),
        event_name: Set(canonical.clone()),
        status: Set(status_label(&mapped).to_string()),
        event_at: Set(event_at),
        raw_payload: Set(String::from_utf8_lossy(&body).into_owned()),
        failure_reason: Set(payload.failure_reason.clone()),
        is_terminal: Set(mapped.is_terminal),
        on_return_leg: Set(mapped.on_return_leg),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    journal
        .insert(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;

    let Some(shipment) = find_shipment(&state, &payload.tracking_number, "v2").await? else {
        return Ok((StatusCode::OK, "ok"));
    };

    record_tracking_event(
        &state,
        &shipment,
        &mapped,
        &payload.event_name,
        payload.location.clone(),
        event_at,
        &body,
    )
    .await?;

    apply_carrier_transition(
        &state,
        &shipment,
        &mapped,
        &canonical,
        event_signature,
        event_at,
        payload.failure_reason.clone(),
    )
    .await?;

    Ok((StatusCode::OK, "ok"))
}

fn parse_payload<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, ServiceError> {
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::ValidationError(format!("Invalid webhook payload: {}", e)))
}

fn require_field(value: &str, name: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "Webhook field {} is required",
            name
        )));
    }
    Ok(())
}

fn status_label(mapped: &MappedEvent) -> &'static str {
    mapped
        .status
        .map(|status| status.as_str())
        .unwrap_or(NO_OP_STATUS)
}

/// Idempotency discriminator for one carrier delivery. The carrier's own
/// event id wins; otherwise name plus reported timestamp; a payload with
/// neither dedupes on the bare name, which collapses blind resends of
/// the same milestone.
fn carrier_event_signature(
    event_id: Option<&str>,
    canonical: &str,
    reported_at: Option<DateTime<Utc>>,
) -> String {
    if let Some(id) = event_id {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    match reported_at {
        Some(at) => format!("{}|{}", canonical, at.to_rfc3339()),
        None => canonical.to_string(),
    }
}

/// A webhook for a tracking number we never issued is authentic but
/// unactionable. Acknowledge it so the carrier stops retrying.
async fn find_shipment(
    state: &AppState,
    tracking_number: &str,
    version: &'static str,
) -> Result<Option<shipment::Model>, ServiceError> {
    match state
        .services
        .shipments
        .find_by_tracking(tracking_number)
        .await
    {
        Ok(shipment) => Ok(Some(shipment)),
        Err(ServiceError::NotFound(_)) => {
            warn!(%tracking_number, version, "webhook for unknown tracking number, acknowledging");
            counter!("orderflow.webhooks.unknown_tracking", 1, "version" => version);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn record_tracking_event(
    state: &AppState,
    shipment: &shipment::Model,
    mapped: &MappedEvent,
    description: &str,
    location: Option<String>,
    event_at: DateTime<Utc>,
    raw_body: &[u8],
) -> Result<(), ServiceError> {
    let row = tracking_event::ActiveModel {
        tracking_number: Set(shipment.tracking_number.clone()),
        order_id: Set(shipment.order_id),
        status: Set(status_label(mapped).to_string()),
        description: Set(description.to_string()),
        location: Set(location),
        event_at: Set(event_at),
        raw_payload: Set(String::from_utf8_lossy(raw_body).into_owned()),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    row.insert(&*state.db)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(())
}

async fn apply_carrier_transition(
    state: &AppState,
    shipment: &shipment::Model,
    mapped: &MappedEvent,
    canonical: &str,
    event_signature: String,
    event_at: DateTime<Utc>,
    failure_reason: Option<String>,
) -> Result<(), ServiceError> {
    let Some(target) = mapped.status else {
        info!(
            tracking_number = %shipment.tracking_number,
            event = canonical,
            "carrier event recorded, no transition mapped"
        );
        return Ok(());
    };

    let outcome = state
        .services
        .transitions
        .apply(TransitionRequest {
            order_id: shipment.order_id,
            target,
            source: TransitionSource::Carrier,
            external_id: shipment.tracking_number.clone(),
            event_signature,
            payment_update: None,
            shipment_update: Some(ShipmentUpdate {
                event_name: canonical.to_string(),
                event_at,
                failure_reason,
                on_return_leg: mapped.on_return_leg,
            }),
        })
        .await?;

    match outcome {
        TransitionOutcome::Applied { from, to } => {
            info!(
                order_id = %shipment.order_id,
                tracking_number = %shipment.tracking_number,
                %from,
                %to,
                "carrier webhook applied"
            );
        }
        TransitionOutcome::NoOp { ref reason } => {
            // Rejected but still acknowledged: the carrier must not retry.
            warn!(
                order_id = %shipment.order_id,
                tracking_number = %shipment.tracking_number,
                event = canonical,
                error = %reason.as_error(),
                "carrier webhook rejected, acknowledged as a no-op"
            );
        }
        TransitionOutcome::PaymentApplied { .. } => {
            info!(
                order_id = %shipment.order_id,
                tracking_number = %shipment.tracking_number,
                event = canonical,
                ?outcome,
                "carrier webhook acknowledged without an order move"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_wins_as_signature() {
        let at = Utc::now();
        assert_eq!(
            carrier_event_signature(Some("evt_42"), "DELIVERED", Some(at)),
            "evt_42"
        );
    }

    #[test]
    fn blank_event_id_falls_back_to_name_and_timestamp() {
        let at = "2024-12-09T14:30:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            carrier_event_signature(Some("  "), "DELIVERED", Some(at)),
            format!("DELIVERED|{}", at.to_rfc3339())
        );
    }

    #[test]
    fn missing_timestamp_dedupes_on_bare_name() {
        assert_eq!(
            carrier_event_signature(None, "PICKED_UP", None),
            "PICKED_UP"
        );
    }

    #[test]
    fn no_op_events_get_the_no_op_label() {
        assert_eq!(status_label(&MappedEvent::no_op()), NO_OP_STATUS);
        assert_eq!(status_label(&map_v2_event("delivered")), "delivered");
    }

    #[test]
    fn required_fields_are_enforced() {
        assert!(require_field("FL123", "tracking_id").is_ok());
        assert!(matches!(
            require_field("   ", "tracking_id"),
            Err(ServiceError::ValidationError(_))
        ));
    }
}
