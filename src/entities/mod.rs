pub mod cart_item;
pub mod category;
pub mod delivery_order;
pub mod diamond;
pub mod discount_code;
pub mod loyalty_setting;
pub mod payment;
pub mod prize;
pub mod prize_redemption;
pub mod product;
pub mod return_order;
pub mod shopping_cart;
pub mod store;
pub mod store_discount;
pub mod user;
pub mod user_points;

// Re-export entities
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use category::{Entity as Category, Model as CategoryModel};
pub use delivery_order::{DeliveryStatus, Entity as DeliveryOrder, Model as DeliveryOrderModel};
pub use diamond::{Entity as Diamond, Model as DiamondModel};
pub use discount_code::{Entity as DiscountCode, Model as DiscountCodeModel};
pub use loyalty_setting::{Entity as LoyaltySetting, Model as LoyaltySettingModel};
pub use payment::{Entity as Payment, Model as PaymentModel, PaymentStatus};
pub use prize::{Entity as Prize, Model as PrizeModel};
pub use prize_redemption::{
    Entity as PrizeRedemption, Model as PrizeRedemptionModel, RedemptionStatus,
};
pub use product::{Entity as Product, Model as ProductModel};
pub use return_order::{Entity as ReturnOrder, Model as ReturnOrderModel, ReturnStatus};
pub use shopping_cart::{Entity as ShoppingCart, Model as ShoppingCartModel};
pub use store::{Entity as Store, Model as StoreModel};
pub use store_discount::{Entity as StoreDiscount, Model as StoreDiscountModel};
pub use user::{Entity as User, Model as UserModel, UserRole};
pub use user_points::{Entity as UserPoints, Model as UserPointsModel};
