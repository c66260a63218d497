use crate::{
    entities::{
        cart_item, category, diamond, discount_code, loyalty_setting, payment, prize,
        prize_redemption, product, store, user_points, CartItem, Category, Diamond, DiscountCode,
        LoyaltySetting, Payment, PaymentStatus, Prize, PrizeRedemption, Product,
        RedemptionStatus, ShoppingCart, Store, UserPoints,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::carts::CartService,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, ModelTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Name of the category that collects auto-created prize products
const PRIZE_CATEGORY_NAME: &str = "Prizes";

/// Loyalty program service.
///
/// Covers the full loyalty surface: the global points-per-diamond setting,
/// diamond allocations, prize administration, per-store point balances,
/// prize redemption settlement, purchase-time points accrual, and discount
/// code application against a cart.
#[derive(Clone)]
pub struct LoyaltyService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    /// Seed for the lazily-created global setting row
    default_points_value: i64,
}

impl LoyaltyService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        default_points_value: i64,
    ) -> Self {
        Self {
            db,
            event_sender,
            default_points_value,
        }
    }

    // ==================== Global settings ====================

    /// Returns the global loyalty settings, creating the singleton row with
    /// the configured default on first read.
    pub async fn settings(&self) -> Result<loyalty_setting::Model, ServiceError> {
        Self::settings_on(&*self.db, self.default_points_value).await
    }

    /// Connection-generic variant used inside transactions.
    pub async fn settings_on<C: ConnectionTrait>(
        conn: &C,
        default_points_value: i64,
    ) -> Result<loyalty_setting::Model, ServiceError> {
        if let Some(settings) = LoyaltySetting::find_by_id(loyalty_setting::SINGLETON_ID)
            .one(conn)
            .await?
        {
            return Ok(settings);
        }

        let created = loyalty_setting::ActiveModel {
            id: Set(loyalty_setting::SINGLETON_ID),
            diamond_points_value: Set(default_points_value),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;

        info!(
            "Created global loyalty settings with {} points per diamond",
            default_points_value
        );
        Ok(created)
    }

    /// The points-per-diamond conversion rate. Callers fetch this once per
    /// request and pass it down; the calculators never re-read it.
    pub async fn points_per_diamond(&self) -> Result<i64, ServiceError> {
        Ok(self.settings().await?.diamond_points_value)
    }

    /// Updates the global points-per-diamond value and rewrites every
    /// diamond allocation so all diamonds hold the same rate afterwards.
    #[instrument(skip(self))]
    pub async fn update_diamond_points_value(
        &self,
        points_value: i64,
    ) -> Result<loyalty_setting::Model, ServiceError> {
        if points_value <= 0 {
            return Err(ServiceError::InvalidInput(
                "Points value must be greater than 0".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let settings = Self::settings_on(&txn, self.default_points_value).await?;
        let mut active: loyalty_setting::ActiveModel = settings.into();
        active.diamond_points_value = Set(points_value);
        active.updated_at = Set(Utc::now());
        let settings = active.update(&txn).await?;

        Diamond::update_many()
            .col_expr(diamond::Column::PointsValue, Expr::value(points_value))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::DiamondPointsValueUpdated { points_value })
            .await;

        info!("Updated global diamond points value to {}", points_value);
        Ok(settings)
    }

    /// The points conversion rate exposed per store. The returned value is
    /// always the global one; a named store is only verified to exist.
    pub async fn points_conversion(
        &self,
        store_id: Option<Uuid>,
    ) -> Result<PointsConversion, ServiceError> {
        if let Some(store_id) = store_id {
            Store::find_by_id(store_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))?;
        }

        Ok(PointsConversion {
            store_id,
            points_per_diamond: self.points_per_diamond().await?,
        })
    }

    // ==================== Diamond administration ====================

    /// Assigns a diamond allocation to a store, always at the global rate.
    #[instrument(skip(self))]
    pub async fn assign_diamonds(
        &self,
        store_id: Uuid,
        quantity: i32,
    ) -> Result<diamond::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "Diamond quantity must be greater than 0".to_string(),
            ));
        }

        Store::find_by_id(store_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))?;

        let points_value = self.points_per_diamond().await?;

        let created = diamond::ActiveModel {
            id: Set(Uuid::new_v4()),
            store_id: Set(store_id),
            quantity: Set(quantity),
            points_value: Set(points_value),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await?;

        Ok(created)
    }

    /// Updates a diamond's quantity, re-applying the global rate.
    #[instrument(skip(self))]
    pub async fn update_diamond(
        &self,
        diamond_id: Uuid,
        quantity: i32,
    ) -> Result<diamond::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "Diamond quantity must be greater than 0".to_string(),
            ));
        }

        let existing = Diamond::find_by_id(diamond_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Diamond {} not found", diamond_id)))?;

        let points_value = self.points_per_diamond().await?;

        let mut active: diamond::ActiveModel = existing.into();
        active.quantity = Set(quantity);
        active.points_value = Set(points_value);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }

    pub async fn delete_diamond(&self, diamond_id: Uuid) -> Result<(), ServiceError> {
        let existing = Diamond::find_by_id(diamond_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Diamond {} not found", diamond_id)))?;
        existing.delete(&*self.db).await?;
        Ok(())
    }

    /// All stores together with their diamond allocations.
    pub async fn stores_with_diamonds(
        &self,
    ) -> Result<Vec<(store::Model, Vec<diamond::Model>)>, ServiceError> {
        let stores = Store::find()
            .find_with_related(Diamond)
            .all(&*self.db)
            .await?;
        Ok(stores)
    }

    // ==================== Prize administration ====================

    pub async fn list_prizes(
        &self,
        store_id: Option<Uuid>,
    ) -> Result<Vec<prize::Model>, ServiceError> {
        let mut query = Prize::find();
        if let Some(store_id) = store_id {
            query = query.filter(prize::Column::StoreId.eq(store_id));
        }
        Ok(query.all(&*self.db).await?)
    }

    pub async fn get_prize(&self, prize_id: Uuid) -> Result<prize::Model, ServiceError> {
        Prize::find_by_id(prize_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Prize {} not found", prize_id)))
    }

    /// Creates a prize. Persisting a product-type prize with descriptive
    /// product fields auto-creates a hidden zero-price product and links it.
    #[instrument(skip(self, input))]
    pub async fn create_prize(&self, input: CreatePrizeInput) -> Result<prize::Model, ServiceError> {
        if input.points_required <= 0 {
            return Err(ServiceError::InvalidInput(
                "points_required must be greater than 0".to_string(),
            ));
        }

        if let Some(store_id) = input.store_id {
            Store::find_by_id(store_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Store {} not found", store_id)))?;
        }

        let txn = self.db.begin().await?;

        let mut created = prize::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(input.name),
            description: Set(input.description),
            points_required: Set(input.points_required),
            store_id: Set(input.store_id),
            is_product: Set(input.is_product),
            product_id: Set(None),
            product_name: Set(input.product_name),
            product_description: Set(input.product_description),
            discount_percentage: Set(input.discount_percentage),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        if created.is_product {
            if let Some(linked) = Self::ensure_linked_product(&txn, &created).await? {
                let mut active: prize::ActiveModel = created.into();
                active.product_id = Set(Some(linked.id));
                created = active.update(&txn).await?;
            }
        }

        txn.commit().await?;

        self.event_sender.send_or_log(Event::PrizeCreated(created.id)).await;

        Ok(created)
    }

    /// Updates prize fields. A prize flipped to product-type without any
    /// product name falls back to a non-product prize; a product-type prize
    /// missing its link gets the hidden product (re)created.
    #[instrument(skip(self, input))]
    pub async fn update_prize(
        &self,
        prize_id: Uuid,
        mut input: UpdatePrizeInput,
    ) -> Result<prize::Model, ServiceError> {
        let existing = self.get_prize(prize_id).await?;

        if input.is_product == Some(true) {
            let has_name = input
                .product_name
                .as_ref()
                .or(existing.product_name.as_ref())
                .is_some();
            if !has_name {
                input.is_product = Some(false);
            }
        }

        let txn = self.db.begin().await?;

        let mut active: prize::ActiveModel = existing.into();
        if let Some(name) = input.name {
            active.name = Set(name);
        }
        if let Some(description) = input.description {
            active.description = Set(Some(description));
        }
        if let Some(points_required) = input.points_required {
            if points_required <= 0 {
                return Err(ServiceError::InvalidInput(
                    "points_required must be greater than 0".to_string(),
                ));
            }
            active.points_required = Set(points_required);
        }
        if let Some(is_product) = input.is_product {
            active.is_product = Set(is_product);
        }
        if let Some(discount_percentage) = input.discount_percentage {
            active.discount_percentage = Set(Some(discount_percentage));
        }
        if let Some(product_name) = input.product_name {
            active.product_name = Set(Some(product_name));
        }
        if let Some(product_description) = input.product_description {
            active.product_description = Set(Some(product_description));
        }
        active.updated_at = Set(Utc::now());

        let mut updated = active.update(&txn).await?;

        if updated.is_product && updated.product_id.is_none() {
            if let Some(linked) = Self::ensure_linked_product(&txn, &updated).await? {
                let mut active: prize::ActiveModel = updated.into();
                active.product_id = Set(Some(linked.id));
                updated = active.update(&txn).await?;
            }
        }

        txn.commit().await?;
        Ok(updated)
    }

    pub async fn delete_prize(&self, prize_id: Uuid) -> Result<(), ServiceError> {
        let existing = self.get_prize(prize_id).await?;
        existing.delete(&*self.db).await?;
        Ok(())
    }

    /// Creates or refreshes the hidden product backing a product-type prize.
    async fn ensure_linked_product<C: ConnectionTrait>(
        conn: &C,
        prize: &prize::Model,
    ) -> Result<Option<product::Model>, ServiceError> {
        let Some(name) = prize.product_name.clone() else {
            warn!(
                "Prize {} is marked as a product but has no product name; skipping product auto-creation",
                prize.id
            );
            return Ok(None);
        };

        let prize_category = match Category::find()
            .filter(category::Column::Name.eq(PRIZE_CATEGORY_NAME))
            .one(conn)
            .await?
        {
            Some(found) => found,
            None => {
                category::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    name: Set(PRIZE_CATEGORY_NAME.to_string()),
                    description: Set(None),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                }
                .insert(conn)
                .await?
            }
        };

        let description = prize
            .product_description
            .clone()
            .unwrap_or_else(|| "Prize item".to_string());

        let existing = Product::find()
            .filter(product::Column::Name.eq(name.clone()))
            .filter(product::Column::IsPrizeProduct.eq(true))
            .one(conn)
            .await?;

        let linked = match existing {
            Some(found) => {
                let mut active: product::ActiveModel = found.into();
                active.description = Set(description);
                active.price = Set(Decimal::ZERO);
                active.category_id = Set(Some(prize_category.id));
                active.store_id = Set(prize.store_id);
                active.is_active = Set(false);
                active.updated_at = Set(Utc::now());
                active.update(conn).await?
            }
            None => {
                product::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    name: Set(name),
                    description: Set(description),
                    price: Set(Decimal::ZERO),
                    category_id: Set(Some(prize_category.id)),
                    store_id: Set(prize.store_id),
                    is_prize_product: Set(true),
                    is_active: Set(false),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                }
                .insert(conn)
                .await?
            }
        };

        info!("Linked hidden product {} to prize {}", linked.id, prize.id);
        Ok(Some(linked))
    }

    // ==================== Point balances ====================

    /// All per-store balances for a user.
    pub async fn user_points(&self, user_id: Uuid) -> Result<Vec<user_points::Model>, ServiceError> {
        Ok(UserPoints::find()
            .filter(user_points::Column::UserId.eq(user_id))
            .all(&*self.db)
            .await?)
    }

    /// The user's balance at one store, if any.
    pub async fn store_balance(
        &self,
        user_id: Uuid,
        store_id: Uuid,
    ) -> Result<Option<user_points::Model>, ServiceError> {
        Ok(UserPoints::find()
            .filter(user_points::Column::UserId.eq(user_id))
            .filter(user_points::Column::StoreId.eq(store_id))
            .one(&*self.db)
            .await?)
    }

    /// Adds points to the user's balance at a store, creating the balance
    /// row when missing.
    pub async fn add_points(
        &self,
        user_id: Uuid,
        store_id: Uuid,
        points: i64,
    ) -> Result<user_points::Model, ServiceError> {
        let record = Self::add_points_on(&*self.db, user_id, store_id, points).await?;
        self.event_sender
            .send_or_log(Event::PointsAwarded {
                user_id,
                store_id,
                points,
            })
            .await;
        Ok(record)
    }

    async fn add_points_on<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
        store_id: Uuid,
        points: i64,
    ) -> Result<user_points::Model, ServiceError> {
        let existing = UserPoints::find()
            .filter(user_points::Column::UserId.eq(user_id))
            .filter(user_points::Column::StoreId.eq(store_id))
            .one(conn)
            .await?;

        match existing {
            Some(record) => {
                let balance = record.points + points;
                let mut active: user_points::ActiveModel = record.into();
                active.points = Set(balance);
                active.updated_at = Set(Utc::now());
                Ok(active.update(conn).await?)
            }
            None => {
                let created = user_points::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    store_id: Set(store_id),
                    points: Set(points),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                };
                Ok(created.insert(conn).await?)
            }
        }
    }

    // ==================== Prize redemption settlement ====================

    /// Redeems a prize against the user's aggregate cross-store balance.
    ///
    /// Runs as a single transaction with the user's balance rows locked for
    /// the duration of the check-and-deduct, so concurrent redemptions
    /// serialize instead of double-spending.
    #[instrument(skip(self))]
    pub async fn redeem_prize(
        &self,
        user_id: Uuid,
        prize_id: Uuid,
    ) -> Result<prize_redemption::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let prize = Prize::find_by_id(prize_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Prize {} not found", prize_id)))?;

        let records = UserPoints::find()
            .filter(user_points::Column::UserId.eq(user_id))
            .order_by_asc(user_points::Column::StoreId)
            .lock_exclusive()
            .all(&txn)
            .await?;

        let total_user_points: i64 = records.iter().map(|r| r.points).sum();
        if total_user_points < prize.points_required {
            return Err(ServiceError::InsufficientPoints(
                "Insufficient total points for redemption".to_string(),
            ));
        }

        let balances: Vec<(Uuid, i64)> = records.iter().map(|r| (r.store_id, r.points)).collect();
        let plan = plan_point_deductions(&balances, prize.store_id, prize.points_required);

        let planned: i64 = plan.iter().map(|step| step.amount).sum();
        if planned < prize.points_required {
            // Unreachable given the aggregate check above; hitting it means
            // the balance rows moved underneath us.
            return Err(ServiceError::SettlementInconsistency(
                "Failed to deduct all required points despite sufficient total".to_string(),
            ));
        }

        for step in &plan {
            if let Some(record) = records.iter().find(|r| r.store_id == step.store_id) {
                let balance = record.points - step.amount;
                let mut active: user_points::ActiveModel = record.clone().into();
                active.points = Set(balance);
                active.updated_at = Set(Utc::now());
                active.update(&txn).await?;
            }
        }

        let mut redemption = prize_redemption::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            prize_id: Set(prize.id),
            redeemed_at: Set(Utc::now()),
            status: Set(RedemptionStatus::Pending),
            discount_code: Set(None),
            used: Set(false),
        };

        if !prize.is_product
            && prize
                .discount_percentage
                .map(|p| p > Decimal::ZERO)
                .unwrap_or(false)
        {
            // The prize name doubles as the discount code; usability is
            // tracked per redemption row, not per code string.
            redemption.discount_code = Set(Some(prize.name.clone()));
        }

        if prize.is_product {
            // Product prizes need no review step
            redemption.status = Set(RedemptionStatus::Approved);
        }

        let redemption = redemption.insert(&txn).await?;

        if prize.is_product {
            match prize.product_id {
                Some(product_id) => {
                    // Failure to place the product in the cart never fails
                    // the redemption itself
                    if let Err(e) =
                        Self::add_prize_product_to_cart(&txn, user_id, product_id).await
                    {
                        warn!(
                            "Error adding prize product {} to cart for user {}: {}",
                            product_id, user_id, e
                        );
                    }
                }
                None => {
                    warn!(
                        "Prize {} is marked as a product but has no linked product",
                        prize.id
                    );
                }
            }
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PrizeRedeemed {
                user_id,
                prize_id: prize.id,
                redemption_id: redemption.id,
            })
            .await;

        info!(
            "User {} redeemed prize {} for {} points",
            user_id, prize.id, prize.points_required
        );
        Ok(redemption)
    }

    /// Upserts the prize's product into the user's active cart with the
    /// quantity forced to 1, regardless of any prior quantity.
    async fn add_prize_product_to_cart<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<(), ServiceError> {
        let cart = CartService::active_cart_on(conn, user_id).await?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(conn)
            .await?;

        match existing {
            Some(item) => {
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(1);
                active.is_prize_redemption = Set(true);
                active.updated_at = Set(Utc::now());
                active.update(conn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    quantity: Set(1),
                    is_prize_redemption: Set(true),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                }
                .insert(conn)
                .await?;
            }
        }

        Ok(())
    }

    /// A user's redemption history, newest first.
    pub async fn redemption_history(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<prize_redemption::Model>, ServiceError> {
        Ok(PrizeRedemption::find()
            .filter(prize_redemption::Column::UserId.eq(user_id))
            .order_by_desc(prize_redemption::Column::RedeemedAt)
            .all(&*self.db)
            .await?)
    }

    // ==================== Points accrual ====================

    /// Points a purchase of this cart would earn, without mutating state.
    pub async fn calculate_purchase_points(
        &self,
        cart_id: Uuid,
    ) -> Result<PointsPreview, ServiceError> {
        let points_per_diamond = self.points_per_diamond().await?;
        Self::purchase_points_on(&*self.db, cart_id, points_per_diamond).await
    }

    /// Partition the cart's items by store and price each store's diamonds
    /// at the given rate. Items without a product or store contribute
    /// nothing; a store failing mid-calculation is skipped.
    pub async fn purchase_points_on<C: ConnectionTrait>(
        conn: &C,
        cart_id: Uuid,
        points_per_diamond: i64,
    ) -> Result<PointsPreview, ServiceError> {
        ShoppingCart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .find_also_related(Product)
            .all(conn)
            .await?;

        let partition = partition_items_by_store(&items);

        let mut breakdown = Vec::new();
        let mut total_points = 0i64;
        let mut total_diamonds = 0i64;

        for store_id in &partition.store_ids {
            let entry = match Self::store_diamond_points(conn, *store_id, points_per_diamond).await
            {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Error calculating points for store {}: {}", store_id, e);
                    continue;
                }
            };
            let Some((store, diamond_count, points)) = entry else {
                continue;
            };

            total_diamonds += diamond_count;
            total_points += points;
            breakdown.push(StorePointsBreakdown {
                store_id: *store_id,
                store_name: store.name,
                amount: partition
                    .amounts
                    .get(store_id)
                    .copied()
                    .unwrap_or(Decimal::ZERO),
                diamond_count,
                points,
            });
        }

        Ok(PointsPreview {
            total_points,
            total_diamonds,
            breakdown,
        })
    }

    /// Mints loyalty points for a completed payment: the same
    /// partition-and-multiply as the preview, written through per-store
    /// balance increments. Per-store failures are skipped, never fatal.
    #[instrument(skip(self))]
    pub async fn add_points_after_payment(
        &self,
        payment_token: &str,
    ) -> Result<Vec<PointsAward>, ServiceError> {
        let settled = Payment::find()
            .filter(payment::Column::PaymentId.eq(payment_token))
            .filter(payment::Column::Status.eq(PaymentStatus::Completed))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Completed payment {} not found", payment_token))
            })?;

        let points_per_diamond = self.points_per_diamond().await?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(settled.cart_id))
            .find_also_related(Product)
            .all(&*self.db)
            .await?;

        let partition = partition_items_by_store(&items);

        let mut awards = Vec::new();
        for store_id in &partition.store_ids {
            let entry =
                match Self::store_diamond_points(&*self.db, *store_id, points_per_diamond).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Error adding points for store {}: {}", store_id, e);
                        continue;
                    }
                };
            let Some((store, diamond_count, points)) = entry else {
                continue;
            };

            let record =
                match Self::add_points_on(&*self.db, settled.user_id, *store_id, points).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Error adding points for store {}: {}", store_id, e);
                        continue;
                    }
                };

            self.event_sender
                .send_or_log(Event::PointsAwarded {
                    user_id: settled.user_id,
                    store_id: *store_id,
                    points,
                })
                .await;

            awards.push(PointsAward {
                store_id: *store_id,
                store_name: store.name,
                diamond_count,
                points_added: points,
                total_points: record.points,
            });
        }

        Ok(awards)
    }

    /// The store record plus its consulted diamond allocation, priced at the
    /// given rate. Stores without diamonds (or deleted stores) yield None.
    async fn store_diamond_points<C: ConnectionTrait>(
        conn: &C,
        store_id: Uuid,
        points_per_diamond: i64,
    ) -> Result<Option<(store::Model, i64, i64)>, ServiceError> {
        let Some(store) = Store::find_by_id(store_id).one(conn).await? else {
            return Ok(None);
        };

        // There may be multiple allocations historically; the earliest
        // created one is the one consulted
        let Some(diamond) = Diamond::find()
            .filter(diamond::Column::StoreId.eq(store_id))
            .order_by_asc(diamond::Column::CreatedAt)
            .one(conn)
            .await?
        else {
            return Ok(None);
        };

        let diamond_count = i64::from(diamond.quantity);
        Ok(Some((store, diamond_count, diamond_count * points_per_diamond)))
    }

    // ==================== Discount code application ====================

    /// Applies a discount code to a cart: prize-redemption codes resolve
    /// first, then admin-issued codes. The matched code is consumed as part
    /// of resolution, and the row is locked so two concurrent applications
    /// of one code produce exactly one success.
    #[instrument(skip(self))]
    pub async fn apply_discount_code(
        &self,
        code: &str,
        cart_id: Uuid,
    ) -> Result<DiscountApplication, ServiceError> {
        let txn = self.db.begin().await?;

        let redemption = PrizeRedemption::find()
            .filter(prize_redemption::Column::DiscountCode.eq(code))
            .filter(prize_redemption::Column::Used.eq(false))
            .order_by_asc(prize_redemption::Column::RedeemedAt)
            .lock_exclusive()
            .one(&txn)
            .await?;

        let application = if let Some(redemption) = redemption {
            let won = Prize::find_by_id(redemption.prize_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Prize {} not found", redemption.prize_id))
                })?;

            let percentage = won
                .discount_percentage
                .filter(|p| *p > Decimal::ZERO)
                .ok_or_else(|| {
                    ServiceError::InvalidDiscountCode("Invalid prize discount code".to_string())
                })?;

            let total_amount = CartService::total_on(&txn, cart_id).await?;
            let discount_amount = (total_amount * percentage) / Decimal::from(100);
            info!(
                "Prize discount calculation: total {} at {}%, discount {}",
                total_amount, percentage, discount_amount
            );

            let mut active: prize_redemption::ActiveModel = redemption.into();
            active.used = Set(true);
            active.update(&txn).await?;

            DiscountApplication {
                original_amount: total_amount,
                discount_percentage: percentage,
                discount_amount,
                final_amount: total_amount - discount_amount,
                discount_code: code.to_string(),
            }
        } else {
            let discount = DiscountCode::find()
                .filter(discount_code::Column::Code.eq(code))
                .filter(discount_code::Column::IsActive.eq(true))
                .filter(discount_code::Column::Used.eq(false))
                .lock_exclusive()
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::InvalidDiscountCode(
                        "Invalid or expired discount code".to_string(),
                    )
                })?;

            if let Some(expiration) = discount.expiration_date {
                if expiration < Utc::now() {
                    return Err(ServiceError::InvalidDiscountCode(
                        "Discount code has expired".to_string(),
                    ));
                }
            }

            let total_amount = CartService::total_on(&txn, cart_id).await?;
            let percentage = discount.value;
            let discount_amount = (total_amount * percentage) / Decimal::from(100);
            info!(
                "Discount calculation: total {} at {}%, discount {}",
                total_amount, percentage, discount_amount
            );

            let mut active: discount_code::ActiveModel = discount.into();
            active.used = Set(true);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;

            DiscountApplication {
                original_amount: total_amount,
                discount_percentage: percentage,
                discount_amount,
                final_amount: total_amount - discount_amount,
                discount_code: code.to_string(),
            }
        };

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::DiscountCodeApplied {
                code: code.to_string(),
                cart_id,
            })
            .await;

        info!(
            "Applied discount code {}: final amount {}",
            code, application.final_amount
        );
        Ok(application)
    }
}

/// Planned deduction for a single store balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointDeduction {
    pub store_id: Uuid,
    pub amount: i64,
}

/// Orders the user's balances into an explicit deduction plan: the prize's
/// own store is drained first, then the remaining stores by descending
/// balance. Every step is capped at what that store holds, so the plan
/// never overdraws a balance.
pub fn plan_point_deductions(
    balances: &[(Uuid, i64)],
    home_store: Option<Uuid>,
    points_required: i64,
) -> Vec<PointDeduction> {
    let mut remaining = points_required;
    let mut plan = Vec::new();
    if remaining <= 0 {
        return plan;
    }

    if let Some(home) = home_store {
        if let Some((store_id, points)) = balances.iter().find(|(id, _)| *id == home) {
            let amount = (*points).min(remaining);
            if amount > 0 {
                plan.push(PointDeduction {
                    store_id: *store_id,
                    amount,
                });
                remaining -= amount;
            }
        }
    }

    let mut others: Vec<&(Uuid, i64)> = balances
        .iter()
        .filter(|(id, _)| Some(*id) != home_store)
        .collect();
    others.sort_by(|a, b| b.1.cmp(&a.1));

    for (store_id, points) in others {
        if remaining <= 0 {
            break;
        }
        let amount = (*points).min(remaining);
        if amount > 0 {
            plan.push(PointDeduction {
                store_id: *store_id,
                amount,
            });
            remaining -= amount;
        }
    }

    plan
}

struct StorePartition {
    store_ids: Vec<Uuid>,
    amounts: HashMap<Uuid, Decimal>,
}

/// Groups cart items by their product's store, accumulating the
/// undiscounted amount spent per store. Items whose product or store is
/// missing are silently excluded.
fn partition_items_by_store(
    items: &[(cart_item::Model, Option<product::Model>)],
) -> StorePartition {
    let mut store_ids = Vec::new();
    let mut amounts: HashMap<Uuid, Decimal> = HashMap::new();

    for (item, linked) in items {
        let Some(linked) = linked else { continue };
        let Some(store_id) = linked.store_id else {
            continue;
        };
        if !amounts.contains_key(&store_id) {
            store_ids.push(store_id);
        }
        // Points-earning amounts use the undiscounted price
        *amounts.entry(store_id).or_insert(Decimal::ZERO) +=
            linked.price * Decimal::from(item.quantity);
    }

    StorePartition { store_ids, amounts }
}

/// Per-store entry of a points preview
#[derive(Debug, Clone, Serialize)]
pub struct StorePointsBreakdown {
    pub store_id: Uuid,
    pub store_name: String,
    pub amount: Decimal,
    pub diamond_count: i64,
    pub points: i64,
}

/// Result of a purchase points calculation
#[derive(Debug, Clone, Serialize)]
pub struct PointsPreview {
    pub total_points: i64,
    pub total_diamonds: i64,
    pub breakdown: Vec<StorePointsBreakdown>,
}

/// Per-store record of points minted after a payment
#[derive(Debug, Clone, Serialize)]
pub struct PointsAward {
    pub store_id: Uuid,
    pub store_name: String,
    pub diamond_count: i64,
    pub points_added: i64,
    pub total_points: i64,
}

/// Result of applying a discount code to a cart
#[derive(Debug, Clone, Serialize)]
pub struct DiscountApplication {
    pub original_amount: Decimal,
    pub discount_percentage: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub discount_code: String,
}

/// The global conversion rate, optionally scoped to a store for display
#[derive(Debug, Clone, Serialize)]
pub struct PointsConversion {
    pub store_id: Option<Uuid>,
    pub points_per_diamond: i64,
}

/// Input for creating a prize
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePrizeInput {
    pub name: String,
    pub description: Option<String>,
    pub points_required: i64,
    pub store_id: Option<Uuid>,
    #[serde(default)]
    pub is_product: bool,
    pub discount_percentage: Option<Decimal>,
    pub product_name: Option<String>,
    pub product_description: Option<String>,
}

/// Input for updating a prize
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdatePrizeInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub points_required: Option<i64>,
    pub is_product: Option<bool>,
    pub discount_percentage: Option<Decimal>,
    pub product_name: Option<String>,
    pub product_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store(tag: u128) -> Uuid {
        Uuid::from_u128(tag)
    }

    #[test]
    fn deduction_drains_home_store_first() {
        let a = store(1);
        let b = store(2);
        let c = store(3);
        let balances = vec![(a, 30), (b, 50), (c, 20)];

        let plan = plan_point_deductions(&balances, Some(a), 60);

        assert_eq!(
            plan,
            vec![
                PointDeduction {
                    store_id: a,
                    amount: 30
                },
                PointDeduction {
                    store_id: b,
                    amount: 30
                },
            ]
        );
    }

    #[test]
    fn deduction_orders_remainder_by_descending_balance() {
        let a = store(1);
        let b = store(2);
        let c = store(3);
        let balances = vec![(a, 10), (b, 40), (c, 70)];

        let plan = plan_point_deductions(&balances, None, 100);

        assert_eq!(plan[0].store_id, c);
        assert_eq!(plan[0].amount, 70);
        assert_eq!(plan[1].store_id, b);
        assert_eq!(plan[1].amount, 30);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn deduction_conserves_points() {
        let balances = vec![(store(1), 25), (store(2), 25), (store(3), 25)];
        let plan = plan_point_deductions(&balances, Some(store(2)), 60);

        let deducted: i64 = plan.iter().map(|d| d.amount).sum();
        assert_eq!(deducted, 60);
        // No store overdrawn
        for step in &plan {
            let (_, balance) = balances
                .iter()
                .find(|(id, _)| *id == step.store_id)
                .unwrap();
            assert!(step.amount <= *balance);
        }
    }

    #[test]
    fn deduction_short_when_total_insufficient() {
        let balances = vec![(store(1), 10), (store(2), 5)];
        let plan = plan_point_deductions(&balances, None, 60);

        let deducted: i64 = plan.iter().map(|d| d.amount).sum();
        assert_eq!(deducted, 15);
    }

    #[test]
    fn deduction_ignores_home_store_without_balance() {
        let balances = vec![(store(1), 50)];
        let plan = plan_point_deductions(&balances, Some(store(9)), 20);

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].store_id, store(1));
        assert_eq!(plan[0].amount, 20);
    }

    fn item(quantity: i32) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            quantity,
            is_prize_redemption: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn product_at(store_id: Option<Uuid>, price: Decimal) -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            name: "Widget".to_string(),
            description: String::new(),
            price,
            category_id: None,
            store_id,
            is_prize_product: false,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn partition_skips_items_without_product_or_store() {
        let s = store(7);
        let items = vec![
            (item(2), Some(product_at(Some(s), dec!(10.00)))),
            (item(1), Some(product_at(None, dec!(99.00)))),
            (item(3), None),
        ];

        let partition = partition_items_by_store(&items);

        assert_eq!(partition.store_ids, vec![s]);
        assert_eq!(partition.amounts[&s], dec!(20.00));
    }

    #[test]
    fn partition_accumulates_undiscounted_amounts_per_store() {
        let s1 = store(1);
        let s2 = store(2);
        let items = vec![
            (item(2), Some(product_at(Some(s1), dec!(10.00)))),
            (item(1), Some(product_at(Some(s2), dec!(5.50)))),
            (item(1), Some(product_at(Some(s1), dec!(2.25)))),
        ];

        let partition = partition_items_by_store(&items);

        assert_eq!(partition.store_ids, vec![s1, s2]);
        assert_eq!(partition.amounts[&s1], dec!(22.25));
        assert_eq!(partition.amounts[&s2], dec!(5.50));
    }
}
