use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};
use utoipa::ToSchema;

use crate::errors::ServiceError;

/// Lifecycle stage of an order.
///
/// Transitions form a forward DAG with two bounded exception loops
/// (`for_shipping` <-> `pickup_failed`, `out_for_delivery` <->
/// `delivery_exception`). Reachability is transitive: a jump to any state
/// further along a valid path is accepted, which is what makes out-of-order
/// webhook delivery safe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OrderStatus {
    PendingPayment,
    Processing,
    ForPacking,
    Packed,
    ForShipping,
    PickedUp,
    Shipped,
    OutForDelivery,
    Delivered,
    Completed,
    Cancelled,
    Returning,
    Returned,
    DeliveryException,
    PickupFailed,
    DeliveryFailed,
    CustomsHold,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Direct successor states.
    pub fn valid_transitions(&self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            PendingPayment => &[Processing, Cancelled],
            Processing => &[ForPacking, Cancelled],
            ForPacking => &[Packed, Cancelled],
            Packed => &[ForShipping, Cancelled],
            ForShipping => &[PickedUp, PickupFailed, Cancelled],
            PickupFailed => &[ForShipping, PickedUp, Cancelled],
            PickedUp => &[Shipped, Returning, Returned],
            Shipped => &[OutForDelivery, CustomsHold, DeliveryException, Returning, Returned],
            OutForDelivery => &[Delivered, DeliveryException, Returning, Returned],
            DeliveryException => &[OutForDelivery, DeliveryFailed, Delivered, Returning, Returned],
            DeliveryFailed => &[Returning, Returned],
            CustomsHold => &[OutForDelivery, Delivered, Returning, Returned],
            Delivered => &[Completed, Returning, Returned],
            Returning => &[Returned],
            Completed | Cancelled | Returned => &[],
        }
    }

    /// No further transition is expected from these absent manual intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Returned
        )
    }

    /// States where the parcel has not been handed to the carrier yet.
    /// This is the window in which user-initiated cancellation is accepted.
    pub fn is_pre_pickup(&self) -> bool {
        matches!(
            self,
            OrderStatus::PendingPayment
                | OrderStatus::Processing
                | OrderStatus::ForPacking
                | OrderStatus::Packed
                | OrderStatus::ForShipping
                | OrderStatus::PickupFailed
        )
    }

    /// States in which a shipment may be requested from the carrier.
    pub fn is_shipment_ready(&self) -> bool {
        matches!(
            self,
            OrderStatus::ForPacking | OrderStatus::Packed | OrderStatus::ForShipping
        )
    }

    /// Transient exception states that must resolve to a forward state,
    /// `returned`, or `cancelled`.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            OrderStatus::DeliveryException
                | OrderStatus::PickupFailed
                | OrderStatus::DeliveryFailed
                | OrderStatus::CustomsHold
        )
    }

    /// True when `target` is reachable from `self` along transition edges.
    /// A state never reaches itself and terminal states reach nothing.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        if *self == target || self.is_terminal() {
            return false;
        }
        let mut seen = vec![*self];
        let mut work = vec![*self];
        while let Some(state) = work.pop() {
            for &next in state.valid_transitions() {
                if next == target {
                    return true;
                }
                if !seen.contains(&next) {
                    seen.push(next);
                    work.push(next);
                }
            }
        }
        false
    }

    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        value
            .parse()
            .map_err(|_| ServiceError::ValidationError(format!("Unknown order status: {value}")))
    }
}

/// Lifecycle of the monetary transaction, independent of the order axis.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
    ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PaymentStatus {
    Pending,
    AwaitingForConfirmation,
    Paid,
    Failed,
    Refunded,
    CodPending,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn valid_transitions(&self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            Pending => &[AwaitingForConfirmation, Failed],
            AwaitingForConfirmation => &[Paid, Failed],
            Paid => &[Refunded],
            // A failed intent can be retried with a fresh transaction id,
            // or flipped to refunded when the gateway collected money for
            // an order that was already closed out.
            Failed => &[AwaitingForConfirmation, Refunded],
            CodPending => &[Paid, Failed],
            Refunded => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Refunded)
    }

    /// The order is clear to ship under this payment status.
    pub fn is_shippable(&self) -> bool {
        matches!(self, PaymentStatus::Paid | PaymentStatus::CodPending)
    }

    /// Direct edges only; unlike the order axis there is no missed-event
    /// tolerance here. The money ledger moves one hop at a time, so a
    /// failed intent must re-enter awaiting_for_confirmation with a
    /// fresh transaction before it can ever read paid again.
    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        value
            .parse()
            .map_err(|_| ServiceError::ValidationError(format!("Unknown payment status: {value}")))
    }
}

/// Where a transition request originated. Recorded on processed events and
/// transition logs so webhook and poller paths stay distinguishable in audit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitionSource {
    Gateway,
    Carrier,
    Poller,
    User,
    System,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn forward_chain_is_reachable_step_by_step() {
        use OrderStatus::*;
        let chain = [
            PendingPayment,
            Processing,
            ForPacking,
            Packed,
            ForShipping,
            PickedUp,
            Shipped,
            OutForDelivery,
            Delivered,
            Completed,
        ];
        for pair in chain.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn later_states_are_reachable_from_earlier_ones() {
        // Out-of-order webhook tolerance: a "delivered" scan may arrive
        // before the "picked up" scan was ever seen.
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::ForShipping.can_transition_to(OrderStatus::OutForDelivery));
        assert!(OrderStatus::PickedUp.can_transition_to(OrderStatus::Completed));
    }

    #[test]
    fn terminal_states_reach_nothing() {
        for terminal in [
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Returned,
        ] {
            for target in OrderStatus::iter() {
                assert!(
                    !terminal.can_transition_to(target),
                    "{} -> {} must be rejected",
                    terminal,
                    target
                );
            }
        }
    }

    #[test]
    fn backward_transitions_are_rejected() {
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::PickedUp));
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Processing));
        assert!(!OrderStatus::PickedUp.can_transition_to(OrderStatus::ForPacking));
    }

    #[test]
    fn cancellation_window_is_pre_pickup_only() {
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::ForShipping.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::PickupFailed.can_transition_to(OrderStatus::Cancelled));

        assert!(!OrderStatus::PickedUp.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn exception_states_resolve_forward_or_to_return() {
        assert!(OrderStatus::DeliveryException.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::DeliveryException.can_transition_to(OrderStatus::DeliveryFailed));
        assert!(OrderStatus::DeliveryFailed.can_transition_to(OrderStatus::Returned));
        assert!(OrderStatus::CustomsHold.can_transition_to(OrderStatus::Delivered));
        assert!(OrderStatus::PickupFailed.can_transition_to(OrderStatus::PickedUp));
    }

    #[test]
    fn return_branch_reachability() {
        assert!(OrderStatus::PickedUp.can_transition_to(OrderStatus::Returned));
        assert!(OrderStatus::OutForDelivery.can_transition_to(OrderStatus::Returning));
        assert!(OrderStatus::Returning.can_transition_to(OrderStatus::Returned));

        // Missed-scan tolerance: a "returned" event may arrive before any
        // pickup scan was ever seen.
        assert!(OrderStatus::ForShipping.can_transition_to(OrderStatus::Returned));
        assert!(!OrderStatus::Returned.can_transition_to(OrderStatus::Returning));
    }

    #[test]
    fn no_state_reaches_itself() {
        for status in OrderStatus::iter() {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in OrderStatus::iter() {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
        assert_eq!(OrderStatus::parse("out_for_delivery").unwrap(), OrderStatus::OutForDelivery);
        assert!(OrderStatus::parse("warehouse_party").is_err());
    }

    #[test]
    fn payment_axis_transitions() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(AwaitingForConfirmation));
        assert!(AwaitingForConfirmation.can_transition_to(Paid));
        assert!(AwaitingForConfirmation.can_transition_to(Failed));
        assert!(Paid.can_transition_to(Refunded));
        assert!(Failed.can_transition_to(AwaitingForConfirmation));
        assert!(Failed.can_transition_to(Refunded));
        assert!(CodPending.can_transition_to(Paid));

        assert!(!Paid.can_transition_to(Pending));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Paid));
    }

    #[test]
    fn payment_axis_never_skips_edges() {
        use PaymentStatus::*;
        // No transitive hops on the money ledger: a failed intent cannot
        // jump straight to paid, and pending cannot skip confirmation.
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Refunded));
        assert!(!AwaitingForConfirmation.can_transition_to(Refunded));
    }

    #[test]
    fn shippable_payment_states() {
        assert!(PaymentStatus::Paid.is_shippable());
        assert!(PaymentStatus::CodPending.is_shippable());
        assert!(!PaymentStatus::AwaitingForConfirmation.is_shippable());
        assert!(!PaymentStatus::Failed.is_shippable());
    }
}
