use crate::state_machine::OrderStatus;

/// Outcome of mapping one carrier event name. `status: None` means the
/// event is recorded for audit but drives no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedEvent {
    pub status: Option<OrderStatus>,
    pub is_terminal: bool,
    pub on_return_leg: bool,
}

impl MappedEvent {
    pub const fn no_op() -> Self {
        Self {
            status: None,
            is_terminal: false,
            on_return_leg: false,
        }
    }

    const fn to(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            is_terminal: false,
            on_return_leg: false,
        }
    }

    const fn terminal(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            is_terminal: true,
            on_return_leg: false,
        }
    }

    const fn returning(status: OrderStatus, is_terminal: bool) -> Self {
        Self {
            status: Some(status),
            is_terminal,
            on_return_leg: true,
        }
    }

    pub fn should_transition(&self) -> bool {
        self.status.is_some()
    }
}

/// Canonical form used for table lookup: trimmed, uppercased, runs of
/// non-alphanumerics collapsed to a single underscore. The carrier has
/// shipped the same event as "Picked Up", "PICKED-UP" and "picked_up"
/// across firmware revisions.
pub fn canonical_event_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_uppercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Legacy vocabulary: coarse milestones only. Total; anything not in
/// the table is a recorded no-op.
pub fn map_v1_event(raw_name: &str) -> MappedEvent {
    match canonical_event_name(raw_name).as_str() {
        "PICKED_UP" => MappedEvent::to(OrderStatus::PickedUp),
        "IN_TRANSIT" => MappedEvent::to(OrderStatus::Shipped),
        "OUT_FOR_DELIVERY" => MappedEvent::to(OrderStatus::OutForDelivery),
        "DELIVERED" => MappedEvent::terminal(OrderStatus::Delivered),
        "RETURNED" | "RETURNED_TO_SENDER" => MappedEvent::returning(OrderStatus::Returned, true),
        "CANCELLED" => MappedEvent::terminal(OrderStatus::Cancelled),
        _ => MappedEvent::no_op(),
    }
}

/// Current vocabulary: adds pickup/delivery exceptions, customs
/// sub-states and the return leg. Total; unknown names no-op.
///
/// CUSTOMS_CLEARED is deliberately audit-only: the parcel is back in
/// transit and the next movement event carries the order forward, so
/// no backward edge out of the customs state is needed.
pub fn map_v2_event(raw_name: &str) -> MappedEvent {
    match canonical_event_name(raw_name).as_str() {
        "PICKUP_CONFIRMED" | "PICKED_UP" => MappedEvent::to(OrderStatus::PickedUp),
        "PICKUP_FAILED" => MappedEvent::to(OrderStatus::PickupFailed),
        "ARRIVED_AT_HUB" | "DEPARTED_ORIGIN_FACILITY" | "IN_TRANSIT" => {
            MappedEvent::to(OrderStatus::Shipped)
        }
        "CUSTOMS_HELD" => MappedEvent::to(OrderStatus::CustomsHold),
        "CUSTOMS_CLEARED" => MappedEvent::no_op(),
        "OUT_FOR_DELIVERY" => MappedEvent::to(OrderStatus::OutForDelivery),
        "DELIVERY_EXCEPTION" => MappedEvent::to(OrderStatus::DeliveryException),
        "DELIVERY_EXCEPTION_MAX_ATTEMPTS_REACHED" | "DELIVERY_FAILED" => {
            MappedEvent::to(OrderStatus::DeliveryFailed)
        }
        "DELIVERED" => MappedEvent::terminal(OrderStatus::Delivered),
        "RETURN_INITIATED" | "RETURN_IN_TRANSIT" => {
            MappedEvent::returning(OrderStatus::Returning, false)
        }
        "RETURNED_TO_SHIPPER" => MappedEvent::returning(OrderStatus::Returned, true),
        "SHIPMENT_CANCELLED" => MappedEvent::terminal(OrderStatus::Cancelled),
        _ => MappedEvent::no_op(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("picked_up", Some(OrderStatus::PickedUp), false, false; "picked_up_snake_case")]
    #[test_case("Picked Up", Some(OrderStatus::PickedUp), false, false; "picked_up_spaced")]
    #[test_case("IN-TRANSIT", Some(OrderStatus::Shipped), false, false)]
    #[test_case("out_for_delivery", Some(OrderStatus::OutForDelivery), false, false)]
    #[test_case("DELIVERED", Some(OrderStatus::Delivered), true, false)]
    #[test_case("returned", Some(OrderStatus::Returned), true, true)]
    #[test_case("returned_to_sender", Some(OrderStatus::Returned), true, true)]
    #[test_case("cancelled", Some(OrderStatus::Cancelled), true, false)]
    #[test_case("LOST_IN_WAREHOUSE", None, false, false)]
    fn v1_mapping(raw: &str, status: Option<OrderStatus>, terminal: bool, return_leg: bool) {
        let mapped = map_v1_event(raw);
        assert_eq!(mapped.status, status);
        assert_eq!(mapped.is_terminal, terminal);
        assert_eq!(mapped.on_return_leg, return_leg);
    }

    #[test_case("pickup_confirmed", Some(OrderStatus::PickedUp), false, false)]
    #[test_case("PICKUP FAILED", Some(OrderStatus::PickupFailed), false, false)]
    #[test_case("arrived_at_hub", Some(OrderStatus::Shipped), false, false)]
    #[test_case("departed_origin_facility", Some(OrderStatus::Shipped), false, false)]
    #[test_case("customs_held", Some(OrderStatus::CustomsHold), false, false)]
    #[test_case("customs_cleared", None, false, false)]
    #[test_case("delivery_exception", Some(OrderStatus::DeliveryException), false, false)]
    #[test_case(
        "delivery_exception_max_attempts_reached",
        Some(OrderStatus::DeliveryFailed),
        false,
        false
    )]
    #[test_case("delivery_failed", Some(OrderStatus::DeliveryFailed), false, false)]
    #[test_case("delivered", Some(OrderStatus::Delivered), true, false)]
    #[test_case("return_initiated", Some(OrderStatus::Returning), false, true)]
    #[test_case("return_in_transit", Some(OrderStatus::Returning), false, true)]
    #[test_case("returned_to_shipper", Some(OrderStatus::Returned), true, true)]
    #[test_case("shipment_cancelled", Some(OrderStatus::Cancelled), true, false)]
    #[test_case("DRONE_REROUTED", None, false, false)]
    fn v2_mapping(raw: &str, status: Option<OrderStatus>, terminal: bool, return_leg: bool) {
        let mapped = map_v2_event(raw);
        assert_eq!(mapped.status, status);
        assert_eq!(mapped.is_terminal, terminal);
        assert_eq!(mapped.on_return_leg, return_leg);
    }

    #[test]
    fn canonical_collapses_separators() {
        assert_eq!(canonical_event_name("  Picked   Up  "), "PICKED_UP");
        assert_eq!(canonical_event_name("picked--up"), "PICKED_UP");
        assert_eq!(canonical_event_name("Delivered!"), "DELIVERED");
        assert_eq!(canonical_event_name("...in.transit..."), "IN_TRANSIT");
        assert_eq!(canonical_event_name(""), "");
    }

    proptest! {
        // Mapping must be total: arbitrary carrier input never panics,
        // and names outside the tables never fire a transition.
        #[test]
        fn arbitrary_names_are_safe(raw in "\\PC{0,64}") {
            let v1 = map_v1_event(&raw);
            let v2 = map_v2_event(&raw);
            if v1.status.is_none() {
                prop_assert!(!v1.is_terminal);
            }
            if v2.status.is_none() {
                prop_assert!(!v2.is_terminal);
                prop_assert!(!v2.on_return_leg);
            }
        }
    }
}
