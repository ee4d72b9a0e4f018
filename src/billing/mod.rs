pub mod api;
pub mod models;
pub mod service;
pub mod stripe;
pub mod webhooks;

pub use models::{Feature, LimitField, Plan, Subscription};
pub use service::BillingService;
pub use stripe::StripeClient;
