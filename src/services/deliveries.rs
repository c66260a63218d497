use crate::{
    entities::{
        delivery_order, payment, return_order, user, DeliveryOrder, DeliveryStatus, Payment,
        PaymentStatus, ReturnOrder, ReturnStatus, User, UserRole,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{Duration, Utc};
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Return requests are accepted this long after delivery.
const RETURN_WINDOW_HOURS: i64 = 48;

/// Delivery fulfillment service.
///
/// Assignment is idempotent per payment, which makes the out-of-band sweep
/// over completed payments safe to re-run at any time.
#[derive(Clone)]
pub struct DeliveryService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl DeliveryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Assigns a delivery order for a payment to any available delivery
    /// user. Calling this twice for the same payment yields exactly one
    /// delivery order.
    #[instrument(skip(self))]
    pub async fn assign_delivery(
        &self,
        payment_id: Uuid,
    ) -> Result<delivery_order::Model, ServiceError> {
        let paid = Payment::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;

        let delivery_user = User::find()
            .filter(user::Column::Role.eq(UserRole::Delivery))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidOperation("No delivery users available".to_string())
            })?;

        if let Some(existing) = DeliveryOrder::find()
            .filter(delivery_order::Column::PaymentId.eq(paid.id))
            .one(&*self.db)
            .await?
        {
            info!("Delivery order already exists for payment {}", payment_id);
            return Ok(existing);
        }

        let created = delivery_order::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_id: Set(paid.id),
            delivery_user_id: Set(delivery_user.id),
            status: Set(DeliveryStatus::Pending),
            assigned_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
            delivered_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        self.event_sender
            .send_or_log(Event::DeliveryAssigned {
                payment_id: paid.id,
                delivery_order_id: created.id,
            })
            .await;

        info!("Created new delivery order {}", created.id);
        Ok(created)
    }

    /// Advances a delivery order one step, only by its assigned user:
    /// PENDING -> IN_PROGRESS -> DELIVERED.
    #[instrument(skip(self))]
    pub async fn update_delivery_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
        user_id: Uuid,
    ) -> Result<delivery_order::Model, ServiceError> {
        let delivery = DeliveryOrder::find_by_id(delivery_id)
            .filter(delivery_order::Column::DeliveryUserId.eq(user_id))
            .filter(
                delivery_order::Column::Status
                    .is_in([DeliveryStatus::Pending, DeliveryStatus::InProgress]),
            )
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(
                    "Active delivery order not found or not authorized".to_string(),
                )
            })?;

        if !valid_delivery_transition(delivery.status, status) {
            return Err(ServiceError::InvalidStatus(format!(
                "Invalid status transition from {} to {}",
                delivery.status.to_value(),
                status.to_value()
            )));
        }

        let old_status = delivery.status;
        let mut active: delivery_order::ActiveModel = delivery.into();
        active.status = Set(status);
        if status == DeliveryStatus::Delivered {
            active.delivered_at = Set(Some(Utc::now()));
        }
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::DeliveryStatusChanged {
                delivery_order_id: updated.id,
                old_status: old_status.to_value(),
                new_status: status.to_value(),
            })
            .await;

        Ok(updated)
    }

    /// Active (non-delivered) orders assigned to a delivery user.
    pub async fn active_orders_for(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<delivery_order::Model>, ServiceError> {
        Ok(DeliveryOrder::find()
            .filter(delivery_order::Column::DeliveryUserId.eq(user_id))
            .filter(
                delivery_order::Column::Status
                    .is_in([DeliveryStatus::Pending, DeliveryStatus::InProgress]),
            )
            .order_by_desc(delivery_order::Column::AssignedAt)
            .all(&*self.db)
            .await?)
    }

    /// Completed deliveries for a delivery user.
    pub async fn history_for(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<delivery_order::Model>, ServiceError> {
        Ok(DeliveryOrder::find()
            .filter(delivery_order::Column::DeliveryUserId.eq(user_id))
            .filter(delivery_order::Column::Status.eq(DeliveryStatus::Delivered))
            .order_by_desc(delivery_order::Column::DeliveredAt)
            .all(&*self.db)
            .await?)
    }

    /// Sweep over completed payments lacking a delivery order, re-invoking
    /// assignment for each. Compensates for best-effort assignment failures
    /// during checkout; safe to re-run because assignment is idempotent.
    #[instrument(skip(self))]
    pub async fn assign_pending_deliveries(
        &self,
    ) -> Result<DeliverySweepSummary, ServiceError> {
        let completed = Payment::find()
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .all(&*self.db)
            .await?;

        let mut summary = DeliverySweepSummary::default();
        for paid in completed {
            let existing = DeliveryOrder::find()
                .filter(delivery_order::Column::PaymentId.eq(paid.id))
                .one(&*self.db)
                .await?;
            if existing.is_some() {
                continue;
            }

            match self.assign_delivery(paid.id).await {
                Ok(order) => {
                    info!(
                        "Created delivery order {} for payment {}",
                        order.id, paid.payment_id
                    );
                    summary.assigned += 1;
                }
                Err(e) => {
                    warn!(
                        "Failed to create delivery for payment {}: {}",
                        paid.payment_id, e
                    );
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// Outcome of a delivery assignment sweep
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliverySweepSummary {
    pub assigned: usize,
    pub failed: usize,
}

/// Return order service.
///
/// Returns are accepted only for delivered orders inside the 48-hour window
/// and are auto-approved onto the original delivery user.
#[derive(Clone)]
pub struct ReturnService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl ReturnService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Creates a return request for one of the user's delivered orders.
    #[instrument(skip(self, reason))]
    pub async fn create_return_request(
        &self,
        delivery_order_id: Uuid,
        user_id: Uuid,
        reason: String,
    ) -> Result<return_order::Model, ServiceError> {
        let delivery = DeliveryOrder::find_by_id(delivery_order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Delivered order not found".to_string()))?;

        let paid = Payment::find_by_id(delivery.payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Delivered order not found".to_string()))?;
        if paid.user_id != user_id {
            return Err(ServiceError::NotFound("Delivered order not found".to_string()));
        }

        if delivery.status != DeliveryStatus::Delivered {
            return Err(ServiceError::InvalidOperation(
                "Order has not been delivered yet".to_string(),
            ));
        }

        let existing = ReturnOrder::find()
            .filter(return_order::Column::DeliveryOrderId.eq(delivery.id))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(
                "A return request already exists for this order".to_string(),
            ));
        }

        let delivered_at = delivery.delivered_at.ok_or_else(|| {
            ServiceError::InvalidOperation("Delivery date not recorded for this order".to_string())
        })?;
        if Utc::now() - delivered_at > Duration::hours(RETURN_WINDOW_HOURS) {
            return Err(ServiceError::InvalidOperation(
                "Return period has expired (48 hours)".to_string(),
            ));
        }

        // Auto-approve and hand back to the original delivery user
        let created = return_order::ActiveModel {
            id: Set(Uuid::new_v4()),
            delivery_order_id: Set(delivery.id),
            user_id: Set(user_id),
            reason: Set(reason),
            status: Set(ReturnStatus::Approved),
            delivery_user_id: Set(Some(delivery.delivery_user_id)),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
            completed_at: Set(None),
        }
        .insert(&*self.db)
        .await?;

        self.event_sender
            .send_or_log(Event::ReturnRequested {
                return_order_id: created.id,
                delivery_order_id: delivery.id,
            })
            .await;

        Ok(created)
    }

    /// Return orders created by a user, newest first.
    pub async fn returns_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<return_order::Model>, ServiceError> {
        Ok(ReturnOrder::find()
            .filter(return_order::Column::UserId.eq(user_id))
            .order_by_desc(return_order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Return orders assigned to a delivery user, newest first.
    pub async fn returns_for_delivery_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<return_order::Model>, ServiceError> {
        Ok(ReturnOrder::find()
            .filter(return_order::Column::DeliveryUserId.eq(user_id))
            .order_by_desc(return_order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Approved returns not yet assigned to a delivery user.
    pub async fn pending_returns(&self) -> Result<Vec<return_order::Model>, ServiceError> {
        Ok(ReturnOrder::find()
            .filter(return_order::Column::Status.eq(ReturnStatus::Approved))
            .filter(return_order::Column::DeliveryUserId.is_null())
            .order_by_desc(return_order::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Advances a return order one step. Moving into IN_PROGRESS requires a
    /// delivery user, taken from the acting user when none is assigned yet.
    #[instrument(skip(self, acting_user))]
    pub async fn update_return_status(
        &self,
        return_id: Uuid,
        status: ReturnStatus,
        acting_user: Option<&user::Model>,
    ) -> Result<return_order::Model, ServiceError> {
        let current = ReturnOrder::find_by_id(return_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Return order not found".to_string()))?;

        if !valid_return_transition(current.status, status) {
            return Err(ServiceError::InvalidStatus(format!(
                "Invalid status transition from {} to {}",
                current.status.to_value(),
                status.to_value()
            )));
        }

        let mut delivery_user_id = current.delivery_user_id;
        if status == ReturnStatus::InProgress && delivery_user_id.is_none() {
            match acting_user {
                Some(actor) if actor.role == UserRole::Delivery => {
                    delivery_user_id = Some(actor.id);
                }
                _ => {
                    return Err(ServiceError::InvalidOperation(
                        "Return must be assigned to a delivery user first".to_string(),
                    ));
                }
            }
        }

        let old_status = current.status;
        let mut active: return_order::ActiveModel = current.into();
        active.status = Set(status);
        active.delivery_user_id = Set(delivery_user_id);
        if status == ReturnStatus::Completed {
            active.completed_at = Set(Some(Utc::now()));
        }
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::ReturnStatusChanged {
                return_order_id: updated.id,
                old_status: old_status.to_value(),
                new_status: status.to_value(),
            })
            .await;

        Ok(updated)
    }

    /// Assigns an approved return to a specific delivery user.
    #[instrument(skip(self))]
    pub async fn assign_return(
        &self,
        return_id: Uuid,
        delivery_user_id: Uuid,
    ) -> Result<return_order::Model, ServiceError> {
        let current = ReturnOrder::find_by_id(return_id)
            .filter(return_order::Column::Status.eq(ReturnStatus::Approved))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound("Approved return order not found".to_string())
            })?;

        let delivery_user = User::find_by_id(delivery_user_id)
            .filter(user::Column::Role.eq(UserRole::Delivery))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Delivery user not found".to_string()))?;

        let mut active: return_order::ActiveModel = current.into();
        active.delivery_user_id = Set(Some(delivery_user.id));
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }

    /// Round-robin assignment of unassigned approved returns.
    #[instrument(skip(self))]
    pub async fn auto_assign_returns(&self) -> Result<usize, ServiceError> {
        let pending = self.pending_returns().await?;

        let delivery_users = User::find()
            .filter(user::Column::Role.eq(UserRole::Delivery))
            .all(&*self.db)
            .await?;
        if delivery_users.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "No delivery users available".to_string(),
            ));
        }

        let mut assigned = 0usize;
        for current in pending {
            let delivery_user = &delivery_users[assigned % delivery_users.len()];
            let mut active: return_order::ActiveModel = current.into();
            active.delivery_user_id = Set(Some(delivery_user.id));
            active.updated_at = Set(Utc::now());
            active.update(&*self.db).await?;
            assigned += 1;
        }

        info!("Assigned {} returns to delivery users", assigned);
        Ok(assigned)
    }
}

fn valid_delivery_transition(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    matches!(
        (from, to),
        (DeliveryStatus::Pending, DeliveryStatus::InProgress)
            | (DeliveryStatus::InProgress, DeliveryStatus::Delivered)
    )
}

fn valid_return_transition(from: ReturnStatus, to: ReturnStatus) -> bool {
    matches!(
        (from, to),
        (ReturnStatus::Pending, ReturnStatus::Approved)
            | (ReturnStatus::Pending, ReturnStatus::Rejected)
            | (ReturnStatus::Approved, ReturnStatus::InProgress)
            | (ReturnStatus::InProgress, ReturnStatus::Completed)
    )
}
