//! MallHub API Library
//!
//! This crate provides the core functionality for the MallHub backend: a
//! multi-tenant mall where stores sell products to customers who earn and
//! redeem loyalty points, pay for carts, and have orders delivered.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod services;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use services::{
    carts::CartService, deliveries::DeliveryService, deliveries::ReturnService,
    discounts::DiscountCodeService, loyalty::LoyaltyService, notifications::NotificationService,
    payments::PaymentService,
};

/// The wired-up service layer. Consumers (an HTTP view layer, a job runner)
/// hold one of these and map operations 1:1 onto their transport.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub loyalty: Arc<LoyaltyService>,
    pub discounts: Arc<DiscountCodeService>,
    pub payments: Arc<PaymentService>,
    pub deliveries: Arc<DeliveryService>,
    pub returns: Arc<ReturnService>,
    pub notifications: Arc<NotificationService>,
}

impl AppServices {
    /// Builds every service against a shared connection pool and event channel.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: &config::AppConfig,
        event_sender: Arc<events::EventSender>,
    ) -> Self {
        let carts = Arc::new(CartService::new(db.clone(), event_sender.clone()));
        let loyalty = Arc::new(LoyaltyService::new(
            db.clone(),
            event_sender.clone(),
            config.default_diamond_points_value,
        ));
        let notifications = Arc::new(NotificationService::new(event_sender.clone()));
        let discounts = Arc::new(DiscountCodeService::new(
            db.clone(),
            event_sender.clone(),
            notifications.clone(),
        ));
        let deliveries = Arc::new(DeliveryService::new(db.clone(), event_sender.clone()));
        let returns = Arc::new(ReturnService::new(db.clone(), event_sender.clone()));
        let payments = Arc::new(PaymentService::new(
            db.clone(),
            event_sender,
            carts.clone(),
            loyalty.clone(),
            deliveries.clone(),
        ));

        Self {
            carts,
            loyalty,
            discounts,
            payments,
            deliveries,
            returns,
            notifications,
        }
    }
}

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: Arc<events::EventSender>,
    pub services: AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: Arc<events::EventSender>,
    ) -> Self {
        let services = AppServices::build(db.clone(), &config, event_sender.clone());
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }

    pub fn loyalty_service(&self) -> Arc<LoyaltyService> {
        self.services.loyalty.clone()
    }

    pub fn payment_service(&self) -> Arc<PaymentService> {
        self.services.payments.clone()
    }

    pub fn delivery_service(&self) -> Arc<DeliveryService> {
        self.services.deliveries.clone()
    }
}
