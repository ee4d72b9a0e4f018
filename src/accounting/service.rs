use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::tenancy::Business;

use super::generator::{backfill, next_occurrence};
use super::models::{
    self, Expense, Investment, RecurringExpense, Withdrawal, TYPE_ONE_TIME,
};
use super::status::RecurringStatus;

/// key: accounting-service -> template lifecycle and manual entries
#[derive(Clone)]
pub struct AccountingService {
    pool: PgPool,
}

#[derive(Debug, Clone)]
pub struct CreateRecurringInput {
    pub amount: Decimal,
    pub currency: Option<String>,
    pub category: String,
    pub frequency: String,
    pub recurring_start_date: NaiveDate,
    pub recurring_end_date: Option<NaiveDate>,
    pub note: Option<String>,
    pub auto_create_historical_expenses: bool,
}

impl AccountingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a template and, when asked, mint its history in the same
    /// transaction. The cursor always lands on the first step strictly
    /// after today so the scheduler never retro-mints.
    pub async fn create_recurring(
        &self,
        business: &Business,
        input: CreateRecurringInput,
    ) -> AppResult<RecurringExpense> {
        models::validate_amount(input.amount)?;
        models::validate_category(&input.category)?;
        models::validate_frequency(&input.frequency)?;
        models::validate_date_range(input.recurring_start_date, input.recurring_end_date)?;

        let currency = input
            .currency
            .unwrap_or_else(|| business.currency.clone());
        let today = Utc::now().date_naive();

        let mut tx = self.pool.begin().await.map_err(AppError::from)?;
        let template = sqlx::query_as::<_, RecurringExpense>(
            "INSERT INTO recurring_expenses \
             (id, business_id, amount, currency, category, frequency, recurring_start_date, \
              recurring_end_date, next_recurring_date, status, note) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(business.id)
        .bind(input.amount)
        .bind(&currency)
        .bind(&input.category)
        .bind(&input.frequency)
        .bind(input.recurring_start_date)
        .bind(input.recurring_end_date)
        .bind(input.recurring_start_date)
        .bind(RecurringStatus::Active.as_str())
        .bind(&input.note)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::from)?;

        let template = if input.auto_create_historical_expenses {
            backfill(&mut tx, &template, today)
                .await
                .map_err(AppError::Internal)?;
            sqlx::query_as::<_, RecurringExpense>(
                "SELECT * FROM recurring_expenses WHERE id = $1",
            )
            .bind(template.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::from)?
        } else {
            // Skip history: advance the cursor past today without emitting.
            let mut cursor = template.recurring_start_date;
            while cursor <= today {
                cursor = next_occurrence(cursor, &template.frequency);
            }
            sqlx::query_as::<_, RecurringExpense>(
                "UPDATE recurring_expenses SET next_recurring_date = $2, updated_at = NOW() \
                 WHERE id = $1 RETURNING *",
            )
            .bind(template.id)
            .bind(cursor)
            .fetch_one(&mut *tx)
            .await
            .map_err(AppError::from)?
        };

        tx.commit().await.map_err(AppError::from)?;
        Ok(template)
    }

    /// Status transition per the machine; anything else is a 409. Returning
    /// to `active` fast-forwards a stale cursor so missed dates are not
    /// retroactively minted.
    pub async fn update_status(
        &self,
        business_id: Uuid,
        template_id: Uuid,
        requested: &str,
    ) -> AppResult<RecurringExpense> {
        let template = sqlx::query_as::<_, RecurringExpense>(
            "SELECT * FROM recurring_expenses WHERE id = $1 AND business_id = $2",
        )
        .bind(template_id)
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::not_found("tenant.not_found"))?;

        let current = RecurringStatus::parse(&template.status)?;
        let to = RecurringStatus::parse(requested)?;
        current.ensure_transition(to)?;

        let mut cursor = template.next_recurring_date;
        if to == RecurringStatus::Active {
            let today = Utc::now().date_naive();
            while cursor <= today {
                cursor = next_occurrence(cursor, &template.frequency);
            }
        }

        let template = sqlx::query_as::<_, RecurringExpense>(
            "UPDATE recurring_expenses \
             SET status = $3, next_recurring_date = $4, updated_at = NOW() \
             WHERE id = $1 AND business_id = $2 RETURNING *",
        )
        .bind(template_id)
        .bind(business_id)
        .bind(to.as_str())
        .bind(cursor)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(template)
    }

    pub async fn create_expense(
        &self,
        business: &Business,
        amount: Decimal,
        occurred_on: NaiveDate,
        category: &str,
        note: Option<String>,
    ) -> AppResult<Expense> {
        models::validate_amount(amount)?;
        models::validate_category(category)?;
        let expense = sqlx::query_as::<_, Expense>(
            "INSERT INTO expenses \
             (id, business_id, amount, currency, occurred_on, category, expense_type, note) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(business.id)
        .bind(amount)
        .bind(&business.currency)
        .bind(occurred_on)
        .bind(category)
        .bind(TYPE_ONE_TIME)
        .bind(note)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(expense)
    }

    pub async fn create_withdrawal(
        &self,
        business: &Business,
        amount: Decimal,
        occurred_on: NaiveDate,
        note: Option<String>,
    ) -> AppResult<Withdrawal> {
        models::validate_amount(amount)?;
        let withdrawal = sqlx::query_as::<_, Withdrawal>(
            "INSERT INTO withdrawals (id, business_id, amount, currency, occurred_on, note) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(business.id)
        .bind(amount)
        .bind(&business.currency)
        .bind(occurred_on)
        .bind(note)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(withdrawal)
    }

    pub async fn create_investment(
        &self,
        business: &Business,
        amount: Decimal,
        occurred_on: NaiveDate,
        note: Option<String>,
    ) -> AppResult<Investment> {
        models::validate_amount(amount)?;
        let investment = sqlx::query_as::<_, Investment>(
            "INSERT INTO investments (id, business_id, amount, currency, occurred_on, note) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(business.id)
        .bind(amount)
        .bind(&business.currency)
        .bind(occurred_on)
        .bind(note)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(investment)
    }

    pub async fn delete_recurring(&self, business_id: Uuid, template_id: Uuid) -> AppResult<()> {
        let result =
            sqlx::query("DELETE FROM recurring_expenses WHERE id = $1 AND business_id = $2")
                .bind(template_id)
                .bind(business_id)
                .execute(&self.pool)
                .await
                .map_err(AppError::from)?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("tenant.not_found"));
        }
        Ok(())
    }
}
