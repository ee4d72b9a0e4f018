use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::EntitySchema;

/// key: accounting-models -> expenses,recurring templates,withdrawals

pub const CATEGORY_TRANSACTION_FEE: &str = "transaction_fee";

pub const EXPENSE_CATEGORIES: &[&str] = &[
    "rent",
    "salaries",
    "utilities",
    "supplies",
    "marketing",
    "shipping",
    "transaction_fee",
    "other",
];

pub const TYPE_ONE_TIME: &str = "one_time";
pub const TYPE_RECURRING: &str = "recurring";

pub const FREQUENCIES: &[&str] = &["daily", "weekly", "monthly", "yearly"];

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RecurringExpense {
    pub id: Uuid,
    pub business_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub category: String,
    pub frequency: String,
    pub recurring_start_date: NaiveDate,
    pub recurring_end_date: Option<NaiveDate>,
    pub next_recurring_date: NaiveDate,
    pub status: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One-time or minted occurrence; occurrences link back to their template.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Expense {
    pub id: Uuid,
    pub business_id: Uuid,
    pub recurring_expense_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_on: NaiveDate,
    pub category: String,
    pub expense_type: String,
    pub note: Option<String>,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub business_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_on: NaiveDate,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Investment {
    pub id: Uuid,
    pub business_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_on: NaiveDate,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub static EXPENSE_SCHEMA: EntitySchema = EntitySchema {
    table: "expenses",
    orderable: &["occurred_on", "amount", "category", "created_at"],
    searchable: &["note", "category"],
    default_order: "occurred_on DESC, created_at DESC",
};

pub static RECURRING_EXPENSE_SCHEMA: EntitySchema = EntitySchema {
    table: "recurring_expenses",
    orderable: &["next_recurring_date", "amount", "category", "status", "created_at"],
    searchable: &["note", "category"],
    default_order: "next_recurring_date ASC",
};

pub static WITHDRAWAL_SCHEMA: EntitySchema = EntitySchema {
    table: "withdrawals",
    orderable: &["occurred_on", "amount", "created_at"],
    searchable: &["note"],
    default_order: "occurred_on DESC",
};

pub static INVESTMENT_SCHEMA: EntitySchema = EntitySchema {
    table: "investments",
    orderable: &["occurred_on", "amount", "created_at"],
    searchable: &["note"],
    default_order: "occurred_on DESC",
};

pub fn validate_amount(amount: Decimal) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::validation(
            "accounting.invalid_amount",
            "amount must be greater than zero",
        ));
    }
    Ok(())
}

pub fn validate_category(category: &str) -> AppResult<()> {
    if !EXPENSE_CATEGORIES.contains(&category) {
        return Err(AppError::validation(
            "accounting.invalid_category",
            format!("unknown expense category: {category}"),
        ));
    }
    Ok(())
}

pub fn validate_frequency(frequency: &str) -> AppResult<()> {
    if !FREQUENCIES.contains(&frequency) {
        return Err(AppError::validation(
            "accounting.invalid_frequency",
            format!("unknown frequency: {frequency}"),
        ));
    }
    Ok(())
}

pub fn validate_date_range(start: NaiveDate, end: Option<NaiveDate>) -> AppResult<()> {
    if let Some(end) = end {
        if end <= start {
            return Err(AppError::validation(
                "accounting.invalid_date_range",
                "recurring end date must be after the start date",
            ));
        }
    }
    Ok(())
}
