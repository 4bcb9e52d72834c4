use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::NotificationSettings;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Payload carried through the outbox for `send_notification` rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNotification {
    pub order_id: Uuid,
    pub order_code: String,
    pub email: String,
    pub kind: String,
}

fn message_for(kind: &str, order_code: &str) -> String {
    match kind {
        "dispatched" => format!("Your order {} is on its way.", order_code),
        "delivered" => format!("Your order {} has been delivered.", order_code),
        "cancelled" => format!("Your order {} has been cancelled.", order_code),
        "returned" => format!("Your order {} is being returned to us.", order_code),
        other => format!("Update for order {}: {}", order_code, other),
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    order_id: Uuid,
    order_code: &'a str,
    email: &'a str,
    kind: &'a str,
    message: String,
}

/// Sends customer-facing notifications. Consumed from the outbox, so a
/// transient sink failure is retried there; it never touches order state.
#[derive(Clone)]
pub struct NotificationService {
    client: reqwest::Client,
    webhook_url: Option<String>,
    event_sender: Option<Arc<EventSender>>,
}

impl NotificationService {
    pub fn new(settings: &NotificationSettings, event_sender: Option<Arc<EventSender>>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url: settings.webhook_url.clone(),
            event_sender,
        }
    }

    /// Deliver one notification. Without a configured sink this degrades
    /// to a structured log line, which is enough for development.
    #[instrument(skip(self, notification), fields(order_id = %notification.order_id, kind = %notification.kind))]
    pub async fn dispatch(&self, notification: &OrderNotification) -> Result<(), ServiceError> {
        let message = message_for(&notification.kind, &notification.order_code);

        match &self.webhook_url {
            Some(url) => {
                let body = WebhookBody {
                    order_id: notification.order_id,
                    order_code: &notification.order_code,
                    email: &notification.email,
                    kind: &notification.kind,
                    message,
                };
                let response = self.client.post(url).json(&body).send().await;
                match response {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) if resp.status().is_server_error() => {
                        return Err(ServiceError::ExternalUnavailable(format!(
                            "notification sink returned {}",
                            resp.status()
                        )));
                    }
                    Ok(resp) => {
                        // A 4xx means the sink rejected us outright;
                        // retrying the same payload will not help.
                        error!(status = %resp.status(), "notification sink rejected payload");
                    }
                    Err(e) => {
                        return Err(ServiceError::ExternalUnavailable(format!(
                            "notification sink unreachable: {}",
                            e
                        )));
                    }
                }
            }
            None => {
                info!(
                    email = %notification.email,
                    order_code = %notification.order_code,
                    %message,
                    "notification (log sink)"
                );
            }
        }

        counter!("orderflow.notifications.sent", 1, "kind" => notification.kind.clone());
        if let Some(sender) = &self.event_sender {
            let event = Event::NotificationSent {
                order_id: notification.order_id,
                kind: notification.kind.clone(),
            };
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send notification event");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_order() {
        assert_eq!(
            message_for("delivered", "ORD-20240601-AB12CD34"),
            "Your order ORD-20240601-AB12CD34 has been delivered."
        );
        assert!(message_for("on_hold", "ORD-1").contains("on_hold"));
    }

    #[tokio::test]
    async fn log_sink_always_succeeds() {
        let service = NotificationService::new(
            &NotificationSettings {
                webhook_url: None,
                timeout_secs: 5,
            },
            None,
        );
        let notification = OrderNotification {
            order_id: Uuid::new_v4(),
            order_code: "ORD-20240601-AB12CD34".into(),
            email: "buyer@example.com".into(),
            kind: "cancelled".into(),
        };
        assert!(service.dispatch(&notification).await.is_ok());
    }
}
