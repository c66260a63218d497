use crate::{
    entities::{
        cart_item, delivery_order, payment, CartItem, DeliveryOrder, Payment, PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::CartService,
        deliveries::DeliveryService,
        loyalty::{DiscountApplication, LoyaltyService, PointsPreview},
    },
};
use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Payment settlement orchestrator.
///
/// Validates the payment instrument, fixes the final charge amount, creates
/// the payment record, and triggers delivery assignment and points accrual
/// as best-effort side effects. The payment row is the durable source of
/// truth; fulfillment bookkeeping is reconciled by the delivery sweep.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    carts: Arc<CartService>,
    loyalty: Arc<LoyaltyService>,
    deliveries: Arc<DeliveryService>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        carts: Arc<CartService>,
        loyalty: Arc<LoyaltyService>,
        deliveries: Arc<DeliveryService>,
    ) -> Self {
        Self {
            db,
            event_sender,
            carts,
            loyalty,
            deliveries,
        }
    }

    /// Processes a payment for the user's active cart.
    ///
    /// Card validation and discount application fail the whole payment;
    /// delivery assignment and points minting are fault-isolated and only
    /// logged when they fail.
    #[instrument(skip(self, input))]
    pub async fn process_payment(
        &self,
        user_id: Uuid,
        input: ProcessPaymentInput,
    ) -> Result<PaymentReceipt, ServiceError> {
        validate_card(&input.card_details)?;

        let cart = self.carts.get_or_create_active_cart(user_id).await?;

        let item_count = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .count(&*self.db)
            .await?;
        if item_count == 0 {
            return Err(ServiceError::EmptyCart);
        }

        // Informational snapshot; must not mutate state
        let points_preview = self.loyalty.calculate_purchase_points(cart.id).await?;

        let mut final_amount = self.carts.cart_total(cart.id).await?;
        let mut discount = None;
        if let Some(code) = input.discount_code.as_deref() {
            let application = self
                .loyalty
                .apply_discount_code(code, cart.id)
                .await
                .map_err(|e| ServiceError::DiscountApplicationFailed(e.to_string()))?;
            info!(
                "Discount {} applied, final amount: {}",
                code, application.final_amount
            );
            final_amount = application.final_amount;
            discount = Some(application);
        }

        let settled = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            cart_id: Set(cart.id),
            amount: Set(final_amount),
            payment_id: Set(generate_payment_token()),
            status: Set(PaymentStatus::Completed),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await?;

        info!("Payment created: {}", settled.payment_id);

        // Best-effort side effects, each independently fault-isolated: the
        // payment must not roll back because fulfillment bookkeeping failed.
        match self.deliveries.assign_delivery(settled.id).await {
            Ok(order) => info!("Delivery order created: {}", order.id),
            Err(e) => warn!(
                "Error assigning delivery for payment {}: {}",
                settled.payment_id, e
            ),
        }

        match self.loyalty.add_points_after_payment(&settled.payment_id).await {
            Ok(awards) => info!(
                "Loyalty points added for payment {}: {} store(s)",
                settled.payment_id,
                awards.len()
            ),
            Err(e) => warn!(
                "Error adding loyalty points for payment {}: {}",
                settled.payment_id, e
            ),
        }

        // Rotate the user onto a fresh cart for subsequent shopping
        self.carts.get_or_create_active_cart(user_id).await?;

        self.event_sender
            .send_or_log(Event::PaymentCompleted(settled.id))
            .await;

        Ok(PaymentReceipt {
            payment: settled,
            points_preview,
            discount,
        })
    }

    /// All payments made by a user, newest first.
    pub async fn payments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        Ok(Payment::find()
            .filter(payment::Column::UserId.eq(user_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// The user's latest completed payment together with its delivery order.
    pub async fn latest_order_status(&self, user_id: Uuid) -> Result<OrderStatus, ServiceError> {
        let settled = Payment::find()
            .filter(payment::Column::UserId.eq(user_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .order_by_desc(payment::Column::CreatedAt)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound("No completed payment found for this user".to_string())
            })?;

        let delivery = DeliveryOrder::find()
            .filter(delivery_order::Column::PaymentId.eq(settled.id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound("Payment found but no delivery order created".to_string())
            })?;

        Ok(OrderStatus {
            payment: settled,
            delivery,
        })
    }

    /// Pre-payment preview: cart total plus the points the purchase would
    /// earn. Read-only.
    pub async fn payment_preview(&self, user_id: Uuid) -> Result<PaymentPreview, ServiceError> {
        let cart = self.carts.get_or_create_active_cart(user_id).await?;

        let item_count = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .count(&*self.db)
            .await?;
        if item_count == 0 {
            return Err(ServiceError::EmptyCart);
        }

        let total_amount = self.carts.cart_total(cart.id).await?;
        let points_preview = self.loyalty.calculate_purchase_points(cart.id).await?;

        Ok(PaymentPreview {
            cart_id: cart.id,
            total_items: item_count,
            total_amount,
            points_preview,
        })
    }
}

/// Generates the globally unique opaque payment token.
fn generate_payment_token() -> String {
    format!(
        "PF-{}",
        Uuid::new_v4().simple().to_string()[..8].to_uppercase()
    )
}

/// Structural card validation: no gateway call is made; a well-formed card
/// is treated as settled.
pub fn validate_card(card: &CardDetails) -> Result<(), ServiceError> {
    if card.card_number.len() != 16 || !card.card_number.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::InvalidCardDetails(
            "Card number must be 16 digits".to_string(),
        ));
    }

    let month: u32 = card
        .expiry_month
        .parse()
        .map_err(|_| ServiceError::InvalidCardDetails("Invalid expiry month".to_string()))?;
    if !(1..=12).contains(&month) {
        return Err(ServiceError::InvalidCardDetails(
            "Invalid expiry month".to_string(),
        ));
    }

    if card.expiry_year.len() != 2 || !card.expiry_year.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::InvalidCardDetails(
            "Invalid expiry year".to_string(),
        ));
    }
    let year: i32 = card
        .expiry_year
        .parse()
        .map_err(|_| ServiceError::InvalidCardDetails("Invalid expiry year".to_string()))?;
    let current_year = Utc::now().year() % 100;
    if year < current_year {
        return Err(ServiceError::InvalidCardDetails(
            "Card has expired".to_string(),
        ));
    }

    if card.cvv.len() != 3 || !card.cvv.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServiceError::InvalidCardDetails("Invalid CVV".to_string()));
    }

    Ok(())
}

/// Card details as supplied by the checkout form
#[derive(Debug, Clone, Deserialize)]
pub struct CardDetails {
    pub card_number: String,
    pub expiry_month: String,
    pub expiry_year: String,
    pub cvv: String,
}

/// Input for processing a payment
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessPaymentInput {
    pub card_details: CardDetails,
    pub discount_code: Option<String>,
}

/// Outcome of a processed payment, including the informational extras the
/// checkout response carries
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: payment::Model,
    pub points_preview: PointsPreview,
    pub discount: Option<DiscountApplication>,
}

/// Latest order status for a user
#[derive(Debug, Clone, Serialize)]
pub struct OrderStatus {
    pub payment: payment::Model,
    pub delivery: delivery_order::Model,
}

/// Pre-payment preview of amounts and potential points
#[derive(Debug, Clone, Serialize)]
pub struct PaymentPreview {
    pub cart_id: Uuid,
    pub total_items: u64,
    pub total_amount: Decimal,
    pub points_preview: PointsPreview,
}
