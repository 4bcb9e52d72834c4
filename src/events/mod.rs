use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod outbox;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// In-process events emitted after a transition commits. These feed
// logging and metrics only; durable side effects go through the outbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
        source: String,
    },
    PaymentConfirmed {
        order_id: Uuid,
        transaction_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
        transaction_id: String,
    },
    ShipmentCreated {
        order_id: Uuid,
        tracking_number: String,
    },
    ShipmentCancelled {
        order_id: Uuid,
        tracking_number: String,
    },
    OrderCancelled(Uuid),
    OrderDelivered(Uuid),
    OrderCompleted(Uuid),
    StockReleased {
        order_id: Uuid,
        sku: String,
        quantity: i32,
    },
    NotificationSent {
        order_id: Uuid,
        kind: String,
    },
}

// Drains the channel for the life of the process; ends only when every
// sender has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderCreated(order_id) => {
                counter!("orderflow.orders.created", 1);
                info!(%order_id, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                source,
            } => {
                counter!("orderflow.transitions.applied", 1, "source" => source.clone());
                info!(%order_id, %old_status, %new_status, %source, "order status changed");
            }
            Event::PaymentConfirmed {
                order_id,
                transaction_id,
            } => {
                counter!("orderflow.payments.confirmed", 1);
                info!(%order_id, %transaction_id, "payment confirmed");
            }
            Event::PaymentFailed {
                order_id,
                transaction_id,
            } => {
                counter!("orderflow.payments.failed", 1);
                warn!(%order_id, %transaction_id, "payment failed");
            }
            Event::ShipmentCreated {
                order_id,
                tracking_number,
            } => {
                counter!("orderflow.shipments.created", 1);
                info!(%order_id, %tracking_number, "shipment created");
            }
            Event::ShipmentCancelled {
                order_id,
                tracking_number,
            } => {
                counter!("orderflow.shipments.cancelled", 1);
                info!(%order_id, %tracking_number, "shipment cancelled");
            }
            Event::OrderCancelled(order_id) => {
                counter!("orderflow.orders.cancelled", 1);
                info!(%order_id, "order cancelled");
            }
            Event::OrderDelivered(order_id) => {
                counter!("orderflow.orders.delivered", 1);
                info!(%order_id, "order delivered");
            }
            Event::OrderCompleted(order_id) => {
                counter!("orderflow.orders.completed", 1);
                info!(%order_id, "order completed");
            }
            Event::StockReleased {
                order_id,
                sku,
                quantity,
            } => {
                counter!("orderflow.stock.released_units", quantity.max(0) as u64);
                info!(%order_id, %sku, quantity, "stock released");
            }
            Event::NotificationSent { order_id, kind } => {
                counter!("orderflow.notifications.sent", 1, "kind" => kind.clone());
                info!(%order_id, %kind, "notification sent");
            }
        }
    }

    warn!("Event processing loop has ended");
}
