#![allow(dead_code)]

use chrono::Utc;
use mallhub_api::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        diamond, product, store, store_discount, user, user_points, UserRole,
    },
    events, AppState,
};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, Schema, Set,
};
use std::sync::Arc;
use uuid::Uuid;

/// Helper harness that wires the full service stack against an in-memory
/// SQLite database with the schema created from the entity definitions.
pub struct TestApp {
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        let cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());

        // A single connection keeps the in-memory database alive and shared.
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("failed to create test database");

        create_schema(&pool).await;

        let (event_sender, rx) = events::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(rx));

        let state = AppState::new(Arc::new(pool), cfg, Arc::new(event_sender));
        Self {
            state,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }
}

async fn create_schema(db: &DatabaseConnection) {
    use mallhub_api::entities::{
        CartItem, Category, DeliveryOrder, Diamond, DiscountCode, LoyaltySetting, Payment, Prize,
        PrizeRedemption, Product, ReturnOrder, ShoppingCart, Store, StoreDiscount, User,
        UserPoints,
    };

    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let statements = [
        schema.create_table_from_entity(User),
        schema.create_table_from_entity(Category),
        schema.create_table_from_entity(Store),
        schema.create_table_from_entity(StoreDiscount),
        schema.create_table_from_entity(Product),
        schema.create_table_from_entity(LoyaltySetting),
        schema.create_table_from_entity(Diamond),
        schema.create_table_from_entity(UserPoints),
        schema.create_table_from_entity(Prize),
        schema.create_table_from_entity(PrizeRedemption),
        schema.create_table_from_entity(DiscountCode),
        schema.create_table_from_entity(ShoppingCart),
        schema.create_table_from_entity(CartItem),
        schema.create_table_from_entity(Payment),
        schema.create_table_from_entity(DeliveryOrder),
        schema.create_table_from_entity(ReturnOrder),
    ];

    for statement in statements {
        db.execute(backend.build(&statement))
            .await
            .expect("failed to create table");
    }
}

pub async fn seed_user(db: &DatabaseConnection, role: UserRole) -> user::Model {
    user::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set("Test User".to_string()),
        email: Set(format!("user-{}@example.com", Uuid::new_v4())),
        role: Set(role),
        is_staff: Set(matches!(role, UserRole::Admin)),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed user")
}

pub async fn seed_store(db: &DatabaseConnection, owner_id: Uuid, name: &str) -> store::Model {
    store::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(format!("{} store", name)),
        owner_id: Set(owner_id),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed store")
}

pub async fn seed_product(
    db: &DatabaseConnection,
    store_id: Option<Uuid>,
    name: &str,
    price: Decimal,
) -> product::Model {
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(format!("{} description", name)),
        price: Set(price),
        category_id: Set(None),
        store_id: Set(store_id),
        is_prize_product: Set(false),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed product")
}

pub async fn seed_diamond(
    db: &DatabaseConnection,
    store_id: Uuid,
    quantity: i32,
    points_value: i64,
) -> diamond::Model {
    diamond::ActiveModel {
        id: Set(Uuid::new_v4()),
        store_id: Set(store_id),
        quantity: Set(quantity),
        points_value: Set(points_value),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed diamond")
}

pub async fn seed_store_discount(
    db: &DatabaseConnection,
    store_id: Uuid,
    percentage: Decimal,
    is_active: bool,
) -> store_discount::Model {
    store_discount::ActiveModel {
        id: Set(Uuid::new_v4()),
        store_id: Set(store_id),
        percentage: Set(percentage),
        is_active: Set(is_active),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed store discount")
}

pub async fn seed_user_points(
    db: &DatabaseConnection,
    user_id: Uuid,
    store_id: Uuid,
    points: i64,
) -> user_points::Model {
    user_points::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        store_id: Set(store_id),
        points: Set(points),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed user points")
}

/// Sum of a user's point balances across all stores.
pub async fn total_points(db: &DatabaseConnection, user_id: Uuid) -> i64 {
    use mallhub_api::entities::{user_points::Column, UserPoints};
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

    UserPoints::find()
        .filter(Column::UserId.eq(user_id))
        .all(db)
        .await
        .expect("failed to load user points")
        .iter()
        .map(|record| record.points)
        .sum()
}
