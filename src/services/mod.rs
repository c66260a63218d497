// Cart management and pricing
pub mod carts;

// Loyalty program: diamonds, prizes, points, redemption, code application
pub mod loyalty;

// Admin discount codes
pub mod discounts;

// Payment settlement orchestration
pub mod payments;

// Delivery fulfillment and returns
pub mod deliveries;

// Outbound customer announcements
pub mod notifications;
