use crate::{
    entities::{
        cart_item, payment, product, shopping_cart, store_discount, CartItem, Payment, Product,
        ShoppingCart, StoreDiscount,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    ModelTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Shopping cart service.
///
/// Owns the cart lifecycle (one active cart per user, rotated once a payment
/// references it), item mutation, and the two pricing primitives the
/// settlement flows are built on: the store-discounted unit price and the
/// canonical cart total.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the user's active cart, creating a fresh one when none exists
    /// or the newest cart has already been settled by a payment.
    #[instrument(skip(self))]
    pub async fn get_or_create_active_cart(
        &self,
        user_id: Uuid,
    ) -> Result<shopping_cart::Model, ServiceError> {
        Self::active_cart_on(&*self.db, user_id).await
    }

    /// Connection-generic variant used inside settlement transactions.
    pub async fn active_cart_on<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
    ) -> Result<shopping_cart::Model, ServiceError> {
        let latest = ShoppingCart::find()
            .filter(shopping_cart::Column::UserId.eq(user_id))
            .order_by_desc(shopping_cart::Column::CreatedAt)
            .one(conn)
            .await?;

        if let Some(cart) = latest {
            let settled = Payment::find()
                .filter(payment::Column::CartId.eq(cart.id))
                .count(conn)
                .await?
                > 0;
            if !settled {
                return Ok(cart);
            }
        }

        let cart = shopping_cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(conn)
        .await?;

        Ok(cart)
    }

    /// Adds a product to the active cart, incrementing the quantity when the
    /// product is already present. Prize items keep their frozen quantity.
    #[instrument(skip(self))]
    pub async fn add_to_cart(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<shopping_cart::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be greater than 0".to_string(),
            ));
        }

        let cart = Self::active_cart_on(&*self.db, user_id).await?;
        let product = Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(product.id))
            .one(&*self.db)
            .await?;

        if let Some(item) = existing {
            if item.is_prize_redemption {
                return Err(ServiceError::InvalidOperation(
                    "Cannot change quantity of a prize item".to_string(),
                ));
            }
            let current = item.quantity;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(current + quantity);
            item.updated_at = Set(Utc::now());
            item.update(&*self.db).await?;
        } else {
            let item = cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(product.id),
                quantity: Set(quantity),
                is_prize_redemption: Set(false),
                created_at: Set(Utc::now()),
                updated_at: Set(Utc::now()),
            };
            item.insert(&*self.db).await?;
        }

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id: product.id,
            })
            .await;

        info!(
            "Added product {} x{} to cart {}",
            product.id, quantity, cart.id
        );
        Ok(cart)
    }

    /// Sets the quantity of a cart item. Prize items reject any mutation.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<shopping_cart::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be greater than 0".to_string(),
            ));
        }

        let cart = Self::active_cart_on(&*self.db, user_id).await?;
        let item = Self::item_in_cart(&*self.db, &cart, item_id).await?;

        if item.is_prize_redemption {
            return Err(ServiceError::InvalidOperation(
                "Cannot change quantity of a prize item".to_string(),
            ));
        }

        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(quantity);
        item.updated_at = Set(Utc::now());
        item.update(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartItemUpdated {
                cart_id: cart.id,
                item_id,
            })
            .await;

        Ok(cart)
    }

    /// Decreases a cart item's quantity by one, removing the item at zero.
    #[instrument(skip(self))]
    pub async fn decrease_item_quantity(
        &self,
        user_id: Uuid,
        item_id: Uuid,
    ) -> Result<shopping_cart::Model, ServiceError> {
        let cart = Self::active_cart_on(&*self.db, user_id).await?;
        let item = Self::item_in_cart(&*self.db, &cart, item_id).await?;

        if item.is_prize_redemption {
            return Err(ServiceError::InvalidOperation(
                "Cannot change quantity of a prize item".to_string(),
            ));
        }

        if item.quantity > 1 {
            let current = item.quantity;
            let mut item: cart_item::ActiveModel = item.into();
            item.quantity = Set(current - 1);
            item.updated_at = Set(Utc::now());
            item.update(&*self.db).await?;

            self.event_sender
                .send_or_log(Event::CartItemUpdated {
                    cart_id: cart.id,
                    item_id,
                })
                .await;
        } else {
            item.delete(&*self.db).await?;

            self.event_sender
                .send_or_log(Event::CartItemRemoved {
                    cart_id: cart.id,
                    item_id,
                })
                .await;
        }

        Ok(cart)
    }

    /// Removes an item from the active cart.
    #[instrument(skip(self))]
    pub async fn remove_from_cart(
        &self,
        user_id: Uuid,
        item_id: Uuid,
    ) -> Result<shopping_cart::Model, ServiceError> {
        let cart = Self::active_cart_on(&*self.db, user_id).await?;
        let item = Self::item_in_cart(&*self.db, &cart, item_id).await?;
        item.delete(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved {
                cart_id: cart.id,
                item_id,
            })
            .await;

        Ok(cart)
    }

    /// Clears all items from the active cart.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, user_id: Uuid) -> Result<shopping_cart::Model, ServiceError> {
        let cart = Self::active_cart_on(&*self.db, user_id).await?;

        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&*self.db)
            .await?;

        self.event_sender.send_or_log(Event::CartCleared(cart.id)).await;

        info!("Cleared cart: {}", cart.id);
        Ok(cart)
    }

    /// Retrieves a cart's items together with their products.
    pub async fn cart_items(
        &self,
        cart_id: Uuid,
    ) -> Result<Vec<(cart_item::Model, Option<product::Model>)>, ServiceError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .find_also_related(Product)
            .all(&*self.db)
            .await?;
        Ok(items)
    }

    /// Discounted unit price when the product's store runs an active
    /// discount with a nonzero percentage; `None` otherwise.
    ///
    /// Resolution is fail-open: a lookup failure falls back to the
    /// undiscounted price rather than aborting the caller.
    pub async fn discounted_unit_price<C: ConnectionTrait>(
        conn: &C,
        product: &product::Model,
    ) -> Option<Decimal> {
        let store_id = product.store_id?;

        let discount = match StoreDiscount::find()
            .filter(store_discount::Column::StoreId.eq(store_id))
            .filter(store_discount::Column::IsActive.eq(true))
            .one(conn)
            .await
        {
            Ok(found) => found?,
            Err(e) => {
                warn!("Error calculating discount: {}", e);
                return None;
            }
        };

        if discount.percentage <= Decimal::ZERO {
            return None;
        }

        apply_percentage_discount(product.price, discount.percentage)
    }

    /// Effective unit price: the discounted price when one applies,
    /// otherwise the list price.
    pub async fn effective_unit_price<C: ConnectionTrait>(
        conn: &C,
        product: &product::Model,
    ) -> Decimal {
        match Self::discounted_unit_price(conn, product).await {
            Some(price) => price,
            None => product.price,
        }
    }

    /// Cart total considering store discounts. This is the canonical
    /// amount-owed basis for discount application and payment; it is
    /// recomputed fresh at every settlement step, never cached.
    pub async fn cart_total(&self, cart_id: Uuid) -> Result<Decimal, ServiceError> {
        Self::total_on(&*self.db, cart_id).await
    }

    /// Connection-generic variant used inside settlement transactions.
    pub async fn total_on<C: ConnectionTrait>(
        conn: &C,
        cart_id: Uuid,
    ) -> Result<Decimal, ServiceError> {
        let cart = ShoppingCart::find_by_id(cart_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .find_also_related(Product)
            .all(conn)
            .await?;

        let mut total = Decimal::ZERO;
        for (item, product) in items {
            let Some(product) = product else { continue };
            let unit_price = Self::effective_unit_price(conn, &product).await;
            total += unit_price * Decimal::from(item.quantity);
        }

        Ok(total)
    }

    async fn item_in_cart<C: ConnectionTrait>(
        conn: &C,
        cart: &shopping_cart::Model,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        CartItem::find_by_id(item_id)
            .filter(cart_item::Column::CartId.eq(cart.id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))
    }
}

/// Applies a percentage discount to a price. The multiplication goes through
/// f64 and is rounded back to a two-decimal fixed-point amount.
fn apply_percentage_discount(price: Decimal, percentage: Decimal) -> Option<Decimal> {
    let price = price.to_f64()?;
    let percentage = percentage.to_f64()?;
    let discounted = price * (1.0 - percentage / 100.0);
    Decimal::from_f64_retain(discounted).map(|d| d.round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn percentage_discount_basic() {
        assert_eq!(
            apply_percentage_discount(dec!(100.00), dec!(10)),
            Some(dec!(90.00))
        );
        assert_eq!(
            apply_percentage_discount(dec!(80.00), dec!(25)),
            Some(dec!(60.00))
        );
    }

    #[test]
    fn percentage_discount_rounds_to_two_places() {
        // 19.99 * 0.85 = 16.9915
        assert_eq!(
            apply_percentage_discount(dec!(19.99), dec!(15)),
            Some(dec!(16.99))
        );
        // 9.99 * 0.67 = 6.6933
        assert_eq!(
            apply_percentage_discount(dec!(9.99), dec!(33)),
            Some(dec!(6.69))
        );
    }

    #[test]
    fn percentage_discount_full_and_zero() {
        assert_eq!(
            apply_percentage_discount(dec!(50.00), dec!(100)),
            Some(dec!(0.00))
        );
        assert_eq!(
            apply_percentage_discount(dec!(50.00), dec!(0)),
            Some(dec!(50.00))
        );
    }

    #[test]
    fn line_total_accumulates_exactly() {
        let unit = dec!(33.33);
        let total = unit * Decimal::from(3);
        assert_eq!(total, dec!(99.99));
    }
}
