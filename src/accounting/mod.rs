pub mod api;
pub mod fees;
pub mod generator;
pub mod models;
pub mod service;
pub mod status;
pub mod summary;

pub use fees::subscribe_order_payments;
pub use generator::{next_occurrence, spawn as spawn_recurring_scheduler};
pub use models::{Expense, RecurringExpense, Withdrawal};
pub use service::AccountingService;
pub use status::RecurringStatus;
