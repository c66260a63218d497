use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User entity. Authentication lives in the identity provider; this table
/// carries the role the core trusts without re-validating.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub email: String,
    pub role: UserRole,
    pub is_staff: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::store::Entity")]
    Stores,
    #[sea_orm(has_many = "super::user_points::Entity")]
    StorePoints,
    #[sea_orm(has_many = "super::shopping_cart::Entity")]
    Carts,
}

impl Related<super::store::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Stores.def()
    }
}

impl Related<super::user_points::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StorePoints.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Role enumeration, supplied by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum UserRole {
    #[sea_orm(string_value = "CUSTOMER")]
    Customer,
    #[sea_orm(string_value = "STORE_MANAGER")]
    StoreManager,
    #[sea_orm(string_value = "ADMIN")]
    Admin,
    #[sea_orm(string_value = "DELIVERY")]
    Delivery,
}
