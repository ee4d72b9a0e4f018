use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{Event, EventBusBuilder, Topic};
use crate::tenancy::Business;

use super::models::{CATEGORY_TRANSACTION_FEE, TYPE_ONE_TIME};

/// key: transaction-fee-automation -> event-driven idempotent upsert

pub fn round_fee(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn compute_fee(order_total: Decimal, fee_percent: Decimal, fee_fixed: Decimal) -> Decimal {
    round_fee(order_total * fee_percent + fee_fixed)
}

/// Runs with elevated trust off the event bus: no actor, no permission
/// checks. Idempotency comes from the partial unique index on
/// `(business_id, order_id, category)`.
pub async fn handle_order_payment(
    pool: &PgPool,
    business_id: Uuid,
    order_id: Uuid,
    order_total: Decimal,
    occurred_on: NaiveDate,
) -> Result<()> {
    let business = sqlx::query_as::<_, Business>("SELECT * FROM businesses WHERE id = $1")
        .bind(business_id)
        .fetch_optional(pool)
        .await?
        .context("order payment for unknown business")?;

    let fee = compute_fee(order_total, business.fee_percent, business.fee_fixed);
    if fee <= Decimal::ZERO {
        debug!(%business_id, %order_id, "fee resolved to zero; skipping");
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO expenses \
         (id, business_id, amount, currency, occurred_on, category, expense_type, order_id, note) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (business_id, order_id, category) \
           WHERE category = 'transaction_fee' AND order_id IS NOT NULL \
         DO UPDATE SET amount = EXCLUDED.amount",
    )
    .bind(Uuid::new_v4())
    .bind(business_id)
    .bind(fee)
    .bind(&business.currency)
    .bind(occurred_on)
    .bind(CATEGORY_TRANSACTION_FEE)
    .bind(TYPE_ONE_TIME)
    .bind(order_id)
    .bind(Option::<String>::None)
    .execute(pool)
    .await?;

    info!(%business_id, %order_id, %fee, "transaction fee posted");
    Ok(())
}

pub fn subscribe_order_payments(builder: &mut EventBusBuilder, pool: PgPool) {
    builder.subscribe(Topic::OrderPaymentSucceeded, move |event| {
        let pool = pool.clone();
        Box::pin(async move {
            let Event::OrderPaymentSucceeded {
                business_id,
                order_id,
                order_total,
                occurred_on,
                ..
            } = event
            else {
                return Ok(());
            };
            handle_order_payment(&pool, business_id, order_id, order_total, occurred_on).await
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn stripe_like_fee_rounds_to_cents() {
        // 100.00 * 0.029 + 0.30 = 3.20
        assert_eq!(compute_fee(dec("100.00"), dec("0.029"), dec("0.30")), dec("3.20"));
        // 19.99 * 0.029 + 0.30 = 0.87971 -> 0.88
        assert_eq!(compute_fee(dec("19.99"), dec("0.029"), dec("0.30")), dec("0.88"));
    }

    #[test]
    fn midpoints_round_away_from_zero() {
        // 5.00 * 0.025 = 0.125 -> 0.13
        assert_eq!(compute_fee(dec("5.00"), dec("0.025"), dec("0")), dec("0.13"));
    }

    #[test]
    fn zero_rate_yields_zero_fee() {
        assert_eq!(compute_fee(dec("250.00"), dec("0"), dec("0")), dec("0.00"));
    }
}
