pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod payment;
pub mod processed_event;
pub mod shipment;
pub mod stock_item;
pub mod stock_movement;
pub mod tracking_event;
pub mod webhook_event;
