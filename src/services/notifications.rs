use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

/// Outbound customer announcements.
///
/// Actual email delivery is owned by the notification collaborator; this
/// service publishes the announcement onto the event channel and treats the
/// dispatch as fire-and-forget. Callers log failures and move on.
#[derive(Clone)]
pub struct NotificationService {
    event_sender: Arc<EventSender>,
}

impl NotificationService {
    pub fn new(event_sender: Arc<EventSender>) -> Self {
        Self { event_sender }
    }

    /// Announces a newly created discount code to customers.
    pub async fn announce_discount_code(
        &self,
        code: &str,
        value: Decimal,
    ) -> Result<(), ServiceError> {
        self.event_sender
            .send(Event::DiscountCodeAnnounced {
                code: code.to_string(),
                value,
            })
            .await
            .map_err(ServiceError::EventError)?;

        info!("Discount code announcement dispatched for {}", code);
        Ok(())
    }
}
