use crate::{
    entities::{discount_code, DiscountCode},
    errors::ServiceError,
    events::{Event, EventSender},
    services::notifications::NotificationService,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Admin discount code administration.
///
/// Codes are one-time-use percentages; consumption happens in the loyalty
/// settlement path when a code is applied to a cart.
#[derive(Clone)]
pub struct DiscountCodeService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    notifications: Arc<NotificationService>,
}

impl DiscountCodeService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            db,
            event_sender,
            notifications,
        }
    }

    /// All discount codes, newest first.
    pub async fn list_codes(&self) -> Result<Vec<discount_code::Model>, ServiceError> {
        Ok(DiscountCode::find()
            .order_by_desc(discount_code::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// Active codes that have not expired.
    pub async fn list_active_codes(&self) -> Result<Vec<discount_code::Model>, ServiceError> {
        let now = Utc::now();
        let codes = DiscountCode::find()
            .filter(discount_code::Column::IsActive.eq(true))
            .order_by_desc(discount_code::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(codes
            .into_iter()
            .filter(|code| code.expiration_date.map(|d| d > now).unwrap_or(true))
            .collect())
    }

    pub async fn get_code(
        &self,
        discount_id: Uuid,
    ) -> Result<Option<discount_code::Model>, ServiceError> {
        Ok(DiscountCode::find_by_id(discount_id).one(&*self.db).await?)
    }

    /// Creates a discount code and announces it to customers. Announcement
    /// delivery is fire-and-forget; a failed dispatch never fails creation.
    #[instrument(skip(self, input))]
    pub async fn create_code(
        &self,
        input: CreateDiscountCodeInput,
    ) -> Result<discount_code::Model, ServiceError> {
        input.validate()?;

        let existing = DiscountCode::find()
            .filter(discount_code::Column::Code.eq(input.code.clone()))
            .one(&*self.db)
            .await?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Discount code {} already exists",
                input.code
            )));
        }

        let created = discount_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(input.code),
            value: Set(input.value),
            description: Set(input.description),
            is_active: Set(input.is_active.unwrap_or(true)),
            used: Set(false),
            expiration_date: Set(input.expiration_date),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await?;

        self.event_sender
            .send_or_log(Event::DiscountCodeCreated(created.id))
            .await;

        if let Err(e) = self
            .notifications
            .announce_discount_code(&created.code, created.value)
            .await
        {
            warn!("Failed to send discount notification: {}", e);
        }

        info!("Created discount code {} ({}%)", created.code, created.value);
        Ok(created)
    }

    /// Updates an existing discount code.
    #[instrument(skip(self, input))]
    pub async fn update_code(
        &self,
        discount_id: Uuid,
        input: UpdateDiscountCodeInput,
    ) -> Result<discount_code::Model, ServiceError> {
        let existing = DiscountCode::find_by_id(discount_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Discount code {} not found", discount_id))
            })?;

        if let Some(value) = input.value {
            validate_percentage(&value)
                .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        }

        let mut active: discount_code::ActiveModel = existing.into();
        if let Some(code) = input.code {
            active.code = Set(code);
        }
        if let Some(value) = input.value {
            active.value = Set(value);
        }
        if let Some(description) = input.description {
            active.description = Set(Some(description));
        }
        if let Some(is_active) = input.is_active {
            active.is_active = Set(is_active);
        }
        if let Some(expiration_date) = input.expiration_date {
            active.expiration_date = Set(Some(expiration_date));
        }
        active.updated_at = Set(Utc::now());

        Ok(active.update(&*self.db).await?)
    }

    pub async fn delete_code(&self, discount_id: Uuid) -> Result<(), ServiceError> {
        let existing = DiscountCode::find_by_id(discount_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Discount code {} not found", discount_id))
            })?;
        existing.delete(&*self.db).await?;
        Ok(())
    }

    /// Looks up a code that is active, unused, and not expired.
    pub async fn validate_code(
        &self,
        code: &str,
    ) -> Result<Option<discount_code::Model>, ServiceError> {
        let found = DiscountCode::find()
            .filter(discount_code::Column::Code.eq(code))
            .filter(discount_code::Column::IsActive.eq(true))
            .filter(discount_code::Column::Used.eq(false))
            .one(&*self.db)
            .await?;

        let now = Utc::now();
        Ok(found.filter(|c| c.expiration_date.map(|d| d > now).unwrap_or(true)))
    }

    /// Marks a code as used, returning None when no consumable code matches.
    pub async fn mark_code_used(
        &self,
        code: &str,
    ) -> Result<Option<discount_code::Model>, ServiceError> {
        let found = DiscountCode::find()
            .filter(discount_code::Column::Code.eq(code))
            .filter(discount_code::Column::IsActive.eq(true))
            .filter(discount_code::Column::Used.eq(false))
            .one(&*self.db)
            .await?;

        match found {
            Some(model) => {
                let mut active: discount_code::ActiveModel = model.into();
                active.used = Set(true);
                active.updated_at = Set(Utc::now());
                Ok(Some(active.update(&*self.db).await?))
            }
            None => Ok(None),
        }
    }
}

/// Input for creating a discount code
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateDiscountCodeInput {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    #[validate(custom = "validate_percentage")]
    pub value: Decimal,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub expiration_date: Option<DateTime<Utc>>,
}

/// Input for updating a discount code
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateDiscountCodeInput {
    pub code: Option<String>,
    pub value: Option<Decimal>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub expiration_date: Option<DateTime<Utc>>,
}

fn validate_percentage(value: &Decimal) -> Result<(), ValidationError> {
    if *value <= Decimal::ZERO || *value > Decimal::from(100) {
        let mut err = ValidationError::new("value");
        err.message = Some("Discount percentage must be between 0 and 100".into());
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input(code: &str, value: Decimal) -> CreateDiscountCodeInput {
        CreateDiscountCodeInput {
            code: code.to_string(),
            value,
            description: None,
            is_active: None,
            expiration_date: None,
        }
    }

    #[test]
    fn accepts_valid_percentage() {
        assert!(input("SAVE15", dec!(15)).validate().is_ok());
        assert!(input("ALL", dec!(100)).validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_percentage() {
        assert!(input("ZERO", dec!(0)).validate().is_err());
        assert!(input("NEG", dec!(-5)).validate().is_err());
        assert!(input("TOO_MUCH", dec!(101)).validate().is_err());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(input("", dec!(10)).validate().is_err());
    }
}
