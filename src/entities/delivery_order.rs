use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery order, one per payment, driven forward by the assigned
/// delivery user: PENDING -> IN_PROGRESS -> DELIVERED.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub payment_id: Uuid,
    pub delivery_user_id: Uuid,
    pub status: DeliveryStatus,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payment::Entity",
        from = "Column::PaymentId",
        to = "super::payment::Column::Id"
    )]
    Payment,
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::DeliveryUserId",
        to = "super::user::Column::Id"
    )]
    DeliveryUser,
    #[sea_orm(has_one = "super::return_order::Entity")]
    ReturnOrder,
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryUser.def()
    }
}

impl Related<super::return_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ReturnOrder.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Delivery status enumeration, strictly forward-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum DeliveryStatus {
    /// Order not yet received
    #[sea_orm(string_value = "PENDING")]
    Pending,
    /// Delivery in progress
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    /// Order delivered
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
}
