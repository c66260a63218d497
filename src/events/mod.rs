use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
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

    /// Sends an event, logging instead of failing when the channel is down.
    /// Event publication must never fail the business operation that emitted it.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

/// Creates a bounded event channel, returning the sender half and receiver half.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded { cart_id: Uuid, product_id: Uuid },
    CartItemUpdated { cart_id: Uuid, item_id: Uuid },
    CartItemRemoved { cart_id: Uuid, item_id: Uuid },
    CartCleared(Uuid),

    // Payment events
    PaymentCompleted(Uuid),

    // Delivery events
    DeliveryAssigned {
        payment_id: Uuid,
        delivery_order_id: Uuid,
    },
    DeliveryStatusChanged {
        delivery_order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Return events
    ReturnRequested {
        return_order_id: Uuid,
        delivery_order_id: Uuid,
    },
    ReturnStatusChanged {
        return_order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Loyalty events
    PointsAwarded {
        user_id: Uuid,
        store_id: Uuid,
        points: i64,
    },
    PrizeCreated(Uuid),
    PrizeRedeemed {
        user_id: Uuid,
        prize_id: Uuid,
        redemption_id: Uuid,
    },
    DiamondPointsValueUpdated {
        points_value: i64,
    },

    // Discount code events
    DiscountCodeCreated(Uuid),
    DiscountCodeAnnounced {
        code: String,
        value: Decimal,
    },
    DiscountCodeApplied {
        code: String,
        cart_id: Uuid,
    },

    // Generic event for custom messages
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

// Function to process incoming events. Consumers that need richer handling
// (webhooks, mail queues) subscribe their own receiver instead.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::PaymentCompleted(payment_id) => {
                info!("Payment completed: {}", payment_id);
            }
            Event::DeliveryAssigned {
                payment_id,
                delivery_order_id,
            } => {
                info!(
                    "Delivery order {} assigned for payment {}",
                    delivery_order_id, payment_id
                );
            }
            Event::PointsAwarded {
                user_id,
                store_id,
                points,
            } => {
                info!(
                    "Awarded {} points to user {} at store {}",
                    points, user_id, store_id
                );
            }
            Event::DiscountCodeAnnounced { ref code, value } => {
                info!("Discount code announced: {} ({}%)", code, value);
            }
            other => {
                info!("Received event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_event_to_receiver() {
        let (sender, mut rx) = channel(8);
        sender
            .send(Event::PaymentCompleted(Uuid::new_v4()))
            .await
            .expect("send should succeed");

        let received = rx.recv().await.expect("event should arrive");
        assert!(matches!(received, Event::PaymentCompleted(_)));
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (sender, rx) = channel(1);
        drop(rx);
        // Must not panic or error out
        sender.send_or_log(Event::CartCreated(Uuid::new_v4())).await;
    }
}
