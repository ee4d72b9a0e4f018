use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::tenancy::Business;

/// key: safe-to-draw -> bounded financial summary

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryBundle {
    pub total_asset_value: Decimal,
    pub total_investments: Decimal,
    pub total_withdrawals: Decimal,
    pub total_expenses: Decimal,
    pub safe_to_draw_amount: Decimal,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
}

pub fn parse_summary_date(raw: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        AppError::validation(
            "summary.invalid_date",
            format!("invalid date: {raw}; expected YYYY-MM-DD"),
        )
    })
}

/// `safe = income − cogs − expenses − withdrawals − buffer`, floored at zero.
pub fn safe_to_draw(
    income: Decimal,
    cogs: Decimal,
    expenses: Decimal,
    withdrawals: Decimal,
    buffer: Decimal,
) -> Decimal {
    (income - cogs - expenses - withdrawals - buffer).max(Decimal::ZERO)
}

async fn bounded_sum(
    pool: &PgPool,
    sql: &str,
    business_id: uuid::Uuid,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> AppResult<Decimal> {
    let value: (Decimal,) = sqlx::query_as(sql)
        .bind(business_id)
        .bind(from)
        .bind(to)
        .fetch_one(pool)
        .await
        .map_err(AppError::from)?;
    Ok(value.0)
}

pub async fn compute_summary(
    pool: &PgPool,
    business: &Business,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> AppResult<SummaryBundle> {
    let income = bounded_sum(
        pool,
        "SELECT COALESCE(SUM(total), 0) FROM orders \
         WHERE business_id = $1 AND status = 'paid' \
           AND ($2::date IS NULL OR occurred_on >= $2) \
           AND ($3::date IS NULL OR occurred_on <= $3)",
        business.id,
        from,
        to,
    )
    .await?;
    let cogs = bounded_sum(
        pool,
        "SELECT COALESCE(SUM(cost_of_goods), 0) FROM orders \
         WHERE business_id = $1 AND status = 'paid' \
           AND ($2::date IS NULL OR occurred_on >= $2) \
           AND ($3::date IS NULL OR occurred_on <= $3)",
        business.id,
        from,
        to,
    )
    .await?;
    let expenses = bounded_sum(
        pool,
        "SELECT COALESCE(SUM(amount), 0) FROM expenses \
         WHERE business_id = $1 \
           AND ($2::date IS NULL OR occurred_on >= $2) \
           AND ($3::date IS NULL OR occurred_on <= $3)",
        business.id,
        from,
        to,
    )
    .await?;
    let withdrawals = bounded_sum(
        pool,
        "SELECT COALESCE(SUM(amount), 0) FROM withdrawals \
         WHERE business_id = $1 \
           AND ($2::date IS NULL OR occurred_on >= $2) \
           AND ($3::date IS NULL OR occurred_on <= $3)",
        business.id,
        from,
        to,
    )
    .await?;
    let investments = bounded_sum(
        pool,
        "SELECT COALESCE(SUM(amount), 0) FROM investments \
         WHERE business_id = $1 \
           AND ($2::date IS NULL OR occurred_on >= $2) \
           AND ($3::date IS NULL OR occurred_on <= $3)",
        business.id,
        from,
        to,
    )
    .await?;

    // Configured buffer wins; otherwise fall back to the trailing 30 days of
    // expenses anchored at `to` (or today).
    let buffer = if business.safety_buffer > Decimal::ZERO {
        business.safety_buffer
    } else {
        let anchor = to.unwrap_or_else(|| Utc::now().date_naive());
        bounded_sum(
            pool,
            "SELECT COALESCE(SUM(amount), 0) FROM expenses \
             WHERE business_id = $1 \
               AND ($2::date IS NULL OR occurred_on >= $2) \
               AND ($3::date IS NULL OR occurred_on <= $3)",
            business.id,
            Some(anchor - Duration::days(30)),
            Some(anchor),
        )
        .await?
    };

    let safe = safe_to_draw(income, cogs, expenses, withdrawals, buffer);

    Ok(SummaryBundle {
        total_asset_value: income - cogs + investments - expenses - withdrawals,
        total_investments: investments,
        total_withdrawals: withdrawals,
        total_expenses: expenses,
        safe_to_draw_amount: safe,
        currency: business.currency.clone(),
        from,
        to,
    })
}
