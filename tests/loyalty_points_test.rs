mod common;

use common::*;
use mallhub_api::entities::{Diamond, UserRole};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;

#[tokio::test]
async fn settings_are_lazily_created_with_the_default_rate() {
    let app = TestApp::new().await;
    let loyalty = app.state.services.loyalty.clone();

    let settings = loyalty.settings().await.expect("settings should create");
    assert_eq!(settings.diamond_points_value, 5000);

    // Subsequent reads return the same row
    let again = loyalty.settings().await.expect("settings should read");
    assert_eq!(again.id, settings.id);
    assert_eq!(again.diamond_points_value, settings.diamond_points_value);
}

#[tokio::test]
async fn accrual_skips_products_without_store() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let customer = seed_user(app.db(), UserRole::Customer).await;
    let orphan = seed_product(app.db(), None, "Orphan", dec!(25.00)).await;

    services
        .carts
        .add_to_cart(customer.id, orphan.id, 1)
        .await
        .expect("add to cart");
    let cart = services
        .carts
        .get_or_create_active_cart(customer.id)
        .await
        .expect("active cart");

    let preview = services
        .loyalty
        .calculate_purchase_points(cart.id)
        .await
        .expect("preview should not raise");

    assert_eq!(preview.total_points, 0);
    assert_eq!(preview.total_diamonds, 0);
    assert!(preview.breakdown.is_empty());
}

#[tokio::test]
async fn store_without_diamonds_contributes_nothing() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let owner = seed_user(app.db(), UserRole::StoreManager).await;
    let customer = seed_user(app.db(), UserRole::Customer).await;
    let store = seed_store(app.db(), owner.id, "No Diamonds").await;
    let product = seed_product(app.db(), Some(store.id), "Plain", dec!(10.00)).await;

    services
        .carts
        .add_to_cart(customer.id, product.id, 3)
        .await
        .expect("add to cart");
    let cart = services
        .carts
        .get_or_create_active_cart(customer.id)
        .await
        .expect("active cart");

    let preview = services
        .loyalty
        .calculate_purchase_points(cart.id)
        .await
        .expect("preview");

    assert_eq!(preview.total_points, 0);
    assert!(preview.breakdown.is_empty());
}

#[tokio::test]
async fn breakdown_uses_undiscounted_amounts() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let owner = seed_user(app.db(), UserRole::StoreManager).await;
    let customer = seed_user(app.db(), UserRole::Customer).await;
    let store = seed_store(app.db(), owner.id, "Store X").await;
    seed_diamond(app.db(), store.id, 2, 5000).await;
    // An active store discount must not shrink the points-earning amount
    seed_store_discount(app.db(), store.id, dec!(10.00), true).await;
    let product = seed_product(app.db(), Some(store.id), "Gadget", dec!(30.00)).await;

    services
        .carts
        .add_to_cart(customer.id, product.id, 2)
        .await
        .expect("add to cart");
    let cart = services
        .carts
        .get_or_create_active_cart(customer.id)
        .await
        .expect("active cart");

    let preview = services
        .loyalty
        .calculate_purchase_points(cart.id)
        .await
        .expect("preview");

    assert_eq!(preview.total_points, 10_000);
    assert_eq!(preview.total_diamonds, 2);
    assert_eq!(preview.breakdown.len(), 1);
    let entry = &preview.breakdown[0];
    assert_eq!(entry.store_id, store.id);
    assert_eq!(entry.store_name, "Store X");
    assert_eq!(entry.amount, dec!(60.00));
    assert_eq!(entry.diamond_count, 2);
    assert_eq!(entry.points, 10_000);

    // The cart total, in contrast, reflects the store discount
    let total = services.carts.cart_total(cart.id).await.expect("total");
    assert_eq!(total, dec!(54.00));
}

#[tokio::test]
async fn earliest_diamond_allocation_is_consulted() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let owner = seed_user(app.db(), UserRole::StoreManager).await;
    let customer = seed_user(app.db(), UserRole::Customer).await;
    let store = seed_store(app.db(), owner.id, "Layered").await;

    // Two historical allocations; only the first created one counts
    let first = seed_diamond(app.db(), store.id, 3, 5000).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    seed_diamond(app.db(), store.id, 9, 5000).await;

    let product = seed_product(app.db(), Some(store.id), "Thing", dec!(5.00)).await;
    services
        .carts
        .add_to_cart(customer.id, product.id, 1)
        .await
        .expect("add to cart");
    let cart = services
        .carts
        .get_or_create_active_cart(customer.id)
        .await
        .expect("active cart");

    let preview = services
        .loyalty
        .calculate_purchase_points(cart.id)
        .await
        .expect("preview");

    assert_eq!(preview.total_diamonds, i64::from(first.quantity));
    assert_eq!(preview.total_points, 15_000);
}

#[tokio::test]
async fn global_rate_update_rewrites_every_diamond() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let owner = seed_user(app.db(), UserRole::StoreManager).await;
    let store_a = seed_store(app.db(), owner.id, "A").await;
    let store_b = seed_store(app.db(), owner.id, "B").await;
    seed_diamond(app.db(), store_a.id, 1, 5000).await;
    seed_diamond(app.db(), store_b.id, 4, 5000).await;

    let settings = services
        .loyalty
        .update_diamond_points_value(3000)
        .await
        .expect("update rate");
    assert_eq!(settings.diamond_points_value, 3000);

    let diamonds = Diamond::find().all(app.db()).await.expect("load diamonds");
    assert_eq!(diamonds.len(), 2);
    for row in &diamonds {
        assert_eq!(row.points_value, 3000);
    }

    // Future accruals price diamonds at the new rate
    let customer = seed_user(app.db(), UserRole::Customer).await;
    let product = seed_product(app.db(), Some(store_b.id), "Item", dec!(9.00)).await;
    services
        .carts
        .add_to_cart(customer.id, product.id, 1)
        .await
        .expect("add to cart");
    let cart = services
        .carts
        .get_or_create_active_cart(customer.id)
        .await
        .expect("active cart");
    let preview = services
        .loyalty
        .calculate_purchase_points(cart.id)
        .await
        .expect("preview");
    assert_eq!(preview.total_points, 12_000);
}

#[tokio::test]
async fn rate_update_rejects_non_positive_values() {
    let app = TestApp::new().await;

    let result = app.state.services.loyalty.update_diamond_points_value(0).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn points_conversion_reports_the_global_rate() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let owner = seed_user(app.db(), UserRole::StoreManager).await;
    let store = seed_store(app.db(), owner.id, "Converted").await;

    let conversion = services
        .loyalty
        .points_conversion(Some(store.id))
        .await
        .expect("conversion");
    assert_eq!(conversion.points_per_diamond, 5000);
    assert_eq!(conversion.store_id, Some(store.id));

    let global = services
        .loyalty
        .points_conversion(None)
        .await
        .expect("conversion");
    assert_eq!(global.store_id, None);

    let missing = services
        .loyalty
        .points_conversion(Some(uuid::Uuid::new_v4()))
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn assign_and_update_diamonds_always_apply_the_global_rate() {
    let app = TestApp::new().await;
    let services = &app.state.services;

    let owner = seed_user(app.db(), UserRole::StoreManager).await;
    let store = seed_store(app.db(), owner.id, "Rated").await;

    let assigned = services
        .loyalty
        .assign_diamonds(store.id, 2)
        .await
        .expect("assign diamonds");
    assert_eq!(assigned.points_value, 5000);
    assert_eq!(assigned.quantity, 2);

    services
        .loyalty
        .update_diamond_points_value(7000)
        .await
        .expect("update rate");

    let updated = services
        .loyalty
        .update_diamond(assigned.id, 5)
        .await
        .expect("update diamond");
    assert_eq!(updated.quantity, 5);
    assert_eq!(updated.points_value, 7000);

    services
        .loyalty
        .delete_diamond(updated.id)
        .await
        .expect("delete diamond");
    assert!(Diamond::find_by_id(updated.id)
        .one(app.db())
        .await
        .expect("load")
        .is_none());
}
